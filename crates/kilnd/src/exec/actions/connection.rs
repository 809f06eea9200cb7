//! Stages guarding the client connection.

use std::sync::Arc;

use tracing::info;

use crate::connection::{Connection, DisconnectAwareConnection};
use crate::exec::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};

/// Closes the connection however the rest of the pipeline ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloseConnectionAfterExecution;

struct CloseOnDrop(Arc<DisconnectAwareConnection>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl CommandAction for CloseConnectionAfterExecution {
    fn name(&self) -> &'static str {
        "close_connection"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let _close = CloseOnDrop(Arc::clone(execution.connection()));
        next.proceed(execution)
    }
}

/// Stops before doing any work when the client is already gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortIfClientDisconnected;

impl CommandAction for AbortIfClientDisconnected {
    fn name(&self) -> &'static str {
        "abort_if_disconnected"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        if execution.connection().is_disconnected() {
            info!(
                target: EXEC_TARGET,
                command = %execution.command().id,
                "client disconnected before the command started; abandoning it"
            );
            return Ok(());
        }
        next.proceed(execution)
    }
}
