//! Stages talking to the daemon state machine.

use kiln_daemon_types::CommandOutcome;
use tracing::info;

use crate::exec::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};

/// Serves stop commands without ever reaching the build stages.
///
/// A stop received during a build cancels that build and answers the stop
/// client straight away; the daemon reaches `Stopped` once the build's lease
/// is released.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleStop;

impl CommandAction for HandleStop {
    fn name(&self) -> &'static str {
        "handle_stop"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        if !execution.command().is_stop() {
            return next.proceed(execution);
        }
        let state = execution.coordinator().request_stop();
        info!(
            target: EXEC_TARGET,
            command = %execution.command().id,
            state = %state,
            "stop requested by client"
        );
        execution.dispatch_result(CommandOutcome::Stopped)?;
        Ok(())
    }
}

/// Takes the build slot, or answers `Busy` when it is taken.
///
/// The lease is held until the rest of the pipeline returns, so the daemon
/// is back to idle before the connection closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartBuildOrRespondWithBusy;

impl CommandAction for StartBuildOrRespondWithBusy {
    fn name(&self) -> &'static str {
        "start_build"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let lease = match execution.coordinator().start_build(&execution.command().id) {
            Ok(lease) => lease,
            Err(rejection) => {
                info!(
                    target: EXEC_TARGET,
                    command = %execution.command().id,
                    state = %rejection.state,
                    "daemon cannot take the build"
                );
                execution.dispatch_result(CommandOutcome::Busy {
                    state: rejection.state,
                })?;
                return Ok(());
            }
        };
        execution.set_cancellation(lease.cancellation().clone());
        let result = next.proceed(execution);
        drop(lease);
        result
    }
}
