//! The action contract and its continuation.

use std::sync::Arc;

use tracing::trace;

use super::{ActionError, CommandExecution, EXEC_TARGET};

/// One stage of the command pipeline.
pub trait CommandAction: Send + Sync {
    /// Short stable name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Runs this stage. Call `next.proceed(execution)` to run the rest of
    /// the pipeline; return without calling it to stop the chain here.
    fn execute(&self, execution: &mut CommandExecution, next: Next<'_>)
    -> Result<(), ActionError>;
}

/// Continuation running the actions after the current one.
///
/// `proceed` takes the continuation by value, so a stage can run the rest
/// of the pipeline at most once.
#[must_use = "an action that drops `Next` without proceeding ends the pipeline"]
pub struct Next<'a> {
    remaining: &'a [Arc<dyn CommandAction>],
}

impl<'a> Next<'a> {
    pub(crate) const fn new(actions: &'a [Arc<dyn CommandAction>]) -> Self {
        Self { remaining: actions }
    }

    /// Runs the next action, or completes the pipeline if none remain.
    pub fn proceed(self, execution: &mut CommandExecution) -> Result<(), ActionError> {
        let Some((action, rest)) = self.remaining.split_first() else {
            return Ok(());
        };
        trace!(target: EXEC_TARGET, stage = action.name(), "entering stage");
        action.execute(execution, Next { remaining: rest })
    }
}
