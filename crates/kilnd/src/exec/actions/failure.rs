//! Converts faults from later stages into failure results.

use std::panic::{self, AssertUnwindSafe};

use kiln_daemon_types::{CommandOutcome, FailureDescription, FailureKind};
use tracing::{error, warn};

use crate::exec::errors::panic_message;
use crate::exec::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};

/// Catches errors and panics below it and reports them to the client.
///
/// If the rest of the pipeline returns normally without dispatching a result
/// while the client is still connected, an internal failure is sent so the
/// client never waits for a result that will not come.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatchAndForwardFailure;

impl CommandAction for CatchAndForwardFailure {
    fn name(&self) -> &'static str {
        "catch_failures"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let caught = panic::catch_unwind(AssertUnwindSafe(|| next.proceed(execution)));
        let fault = match caught {
            Ok(Ok(())) => return ensure_result(execution),
            Ok(Err(fault)) => fault,
            Err(payload) => ActionError::Panicked {
                message: panic_message(payload.as_ref()),
            },
        };

        error!(
            target: EXEC_TARGET,
            command = %execution.command().id,
            error = %fault,
            "command failed inside the daemon"
        );
        if execution.result_dispatched() {
            return Ok(());
        }
        let description = FailureDescription::from_error(FailureKind::Daemon, &fault);
        execution
            .dispatch_result(CommandOutcome::Failure(description))
            .map(drop)
    }
}

fn ensure_result(execution: &mut CommandExecution) -> Result<(), ActionError> {
    if execution.result_dispatched() || execution.connection().is_disconnected() {
        return Ok(());
    }
    warn!(
        target: EXEC_TARGET,
        command = %execution.command().id,
        "pipeline finished without a result; reporting an internal failure"
    );
    execution
        .dispatch_result(CommandOutcome::failure(
            FailureKind::Daemon,
            "the daemon finished the command without producing a result",
        ))
        .map(drop)
}
