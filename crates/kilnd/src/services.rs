//! Process-scoped collaborators shared by every command.

use std::fmt;
use std::sync::Arc;

use crate::build::BuildEngine;
use crate::context::DaemonContext;
use crate::environment::ProcessEnvironment;
use crate::logging::LogRouter;
use crate::state::DaemonStateCoordinator;
use crate::warnings::WarningTracker;

/// Long-lived services created at bootstrap and torn down with the process.
///
/// Only the coordinator carries cross-connection state that changes over
/// time; the log router and warning tracker are process-wide but only the
/// admitted build's pipeline mutates them.
#[derive(Clone)]
pub struct DaemonServices {
    /// Identity of this daemon.
    pub context: Arc<DaemonContext>,
    /// The single build slot.
    pub coordinator: Arc<DaemonStateCoordinator>,
    /// Engine running builds.
    pub engine: Arc<dyn BuildEngine>,
    /// Process working directory and variables.
    pub environment: Arc<dyn ProcessEnvironment>,
    /// Client log redirection.
    pub log_router: LogRouter,
    /// One-time warnings.
    pub warnings: Arc<WarningTracker>,
}

impl fmt::Debug for DaemonServices {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DaemonServices")
            .field("context", &self.context)
            .field("coordinator", &self.coordinator)
            .field("log_router", &self.log_router)
            .finish_non_exhaustive()
    }
}
