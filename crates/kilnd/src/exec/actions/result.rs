//! Result delivery and per-build cleanup.

use std::sync::Arc;

use tracing::info;

use crate::exec::{ActionError, CommandAction, CommandExecution, Delivery, EXEC_TARGET, Next};
use crate::warnings::WarningTracker;

/// Sends the build's outcome once the inner stages return.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReturnResult;

impl CommandAction for ReturnResult {
    fn name(&self) -> &'static str {
        "return_result"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        next.proceed(execution)?;
        let outcome = execution
            .take_outcome()
            .ok_or_else(|| ActionError::MissingOutcome {
                command: execution.command().id.clone(),
            })?;
        if execution.dispatch_result(outcome)? == Delivery::ClientDisconnected {
            info!(
                target: EXEC_TARGET,
                command = %execution.command().id,
                "client left before the result could be delivered"
            );
        }
        Ok(())
    }
}

/// Clears one-time warnings so each build starts fresh.
pub struct ResetWarnings {
    warnings: Arc<WarningTracker>,
}

impl ResetWarnings {
    /// Creates the stage over `warnings`.
    #[must_use]
    pub const fn new(warnings: Arc<WarningTracker>) -> Self {
        Self { warnings }
    }
}

impl CommandAction for ResetWarnings {
    fn name(&self) -> &'static str {
        "reset_warnings"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        self.warnings.reset();
        next.proceed(execution)
    }
}
