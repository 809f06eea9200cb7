//! The build boundary and its disconnect watch.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use kiln_daemon_types::{
    CancellationReason, CommandOutcome, FailureDescription, FailureKind,
};
use tracing::{error, warn};

use crate::build::{BuildEngine, BuildOutcome, BuildRequest};
use crate::connection::DisconnectAwareConnection;
use crate::exec::errors::panic_message;
use crate::exec::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};
use crate::warnings::WarningTracker;

/// Cancels the running build when the client disconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchForDisconnection;

struct ClearWatch(Arc<DisconnectAwareConnection>);

impl Drop for ClearWatch {
    fn drop(&mut self) {
        self.0.on_disconnect(None);
    }
}

impl CommandAction for WatchForDisconnection {
    fn name(&self) -> &'static str {
        "watch_disconnection"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let coordinator = Arc::clone(execution.coordinator());
        let command = execution.command().id.clone();
        let connection = Arc::clone(execution.connection());
        let _watch = ClearWatch(Arc::clone(&connection));
        // The watch is cleared before stage 5 releases the lease, so the
        // active build is always this command's.
        connection.on_disconnect(Some(Box::new(move || {
            if coordinator.cancel_build(CancellationReason::ClientDisconnected) {
                warn!(
                    target: EXEC_TARGET,
                    command = %command,
                    "client disconnected; cancelling build"
                );
            }
        })));
        next.proceed(execution)
    }
}

/// Hands the build to the engine and records what happened.
///
/// Engine errors and panics become `Engine` failures; a raised cancellation
/// token turns any outcome into `Cancelled`. This stage never calls the
/// continuation.
pub struct ExecuteBuild {
    engine: Arc<dyn BuildEngine>,
    warnings: Arc<WarningTracker>,
}

impl ExecuteBuild {
    /// Creates the stage over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn BuildEngine>, warnings: Arc<WarningTracker>) -> Self {
        Self { engine, warnings }
    }
}

impl CommandAction for ExecuteBuild {
    fn name(&self) -> &'static str {
        "execute_build"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        _next: Next<'_>,
    ) -> Result<(), ActionError> {
        let command_id = execution.command().id.clone();
        let invocation = execution
            .command()
            .invocation()
            .cloned()
            .ok_or_else(|| ActionError::MissingInvocation {
                command: command_id.clone(),
            })?;
        let cancellation = execution.cancellation().clone();
        let request = BuildRequest {
            command_id: command_id.clone(),
            invocation,
            context: Arc::clone(execution.daemon_context()),
            input: execution
                .take_build_input()
                .unwrap_or_else(|| Box::new(io::empty())),
            cancellation: cancellation.clone(),
            warnings: Arc::clone(&self.warnings),
        };

        let engine = &self.engine;
        let ran = panic::catch_unwind(AssertUnwindSafe(|| engine.run_build(request)));
        let outcome = match ran {
            Ok(Ok(BuildOutcome::Success { payload })) => CommandOutcome::Success { payload },
            Ok(Ok(BuildOutcome::Failure(description))) => CommandOutcome::Failure(description),
            Ok(Err(fault)) => {
                if !cancellation.is_cancelled() {
                    error!(
                        target: EXEC_TARGET,
                        command = %command_id,
                        error = %fault,
                        "build engine failed"
                    );
                }
                CommandOutcome::Failure(FailureDescription::from_error(FailureKind::Engine, &fault))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    target: EXEC_TARGET,
                    command = %command_id,
                    panic = %message,
                    "build engine panicked"
                );
                CommandOutcome::failure(
                    FailureKind::Engine,
                    format!("build engine panicked: {message}"),
                )
            }
        };

        let outcome = match cancellation.reason() {
            Some(reason) => CommandOutcome::Cancelled { reason },
            None => outcome,
        };
        execution.set_outcome(outcome);
        Ok(())
    }
}
