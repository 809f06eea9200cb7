//! Streams build logs to the client.

use std::sync::Arc;

use crate::exec::{ActionError, CommandAction, CommandExecution, Next};
use crate::logging::{ClientLogSink, LogRouter};

/// Redirects log events raised by the rest of the pipeline, and by threads
/// the build runs in its scope, to the connection.
pub struct LogToClient {
    router: LogRouter,
}

impl LogToClient {
    /// Creates the stage over `router`.
    #[must_use]
    pub const fn new(router: LogRouter) -> Self {
        Self { router }
    }
}

impl CommandAction for LogToClient {
    fn name(&self) -> &'static str {
        "log_to_client"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let sink = ClientLogSink::new(Arc::clone(execution.connection()));
        let redirection = self.router.redirect(Arc::new(sink));
        let result = next.proceed(execution);
        drop(redirection);
        result
    }
}
