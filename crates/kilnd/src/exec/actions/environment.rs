//! Applies the build's working directory and variables.

use std::sync::Arc;

use crate::environment::{EnvironmentOverride, ProcessEnvironment};
use crate::exec::{ActionError, CommandAction, CommandExecution, Next};

/// Applies the invocation's environment for the rest of the pipeline.
pub struct EstablishBuildEnvironment {
    environment: Arc<dyn ProcessEnvironment>,
}

impl EstablishBuildEnvironment {
    /// Creates the stage over `environment`.
    #[must_use]
    pub fn new(environment: Arc<dyn ProcessEnvironment>) -> Self {
        Self { environment }
    }
}

impl CommandAction for EstablishBuildEnvironment {
    fn name(&self) -> &'static str {
        "establish_environment"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let invocation =
            execution
                .command()
                .invocation()
                .ok_or_else(|| ActionError::MissingInvocation {
                    command: execution.command().id.clone(),
                })?;
        let guard = EnvironmentOverride::apply(
            Arc::clone(&self.environment),
            invocation
                .working_directory
                .as_ref()
                .map(|directory| directory.as_std_path()),
            &invocation.environment,
        )?;
        let result = next.proceed(execution);
        drop(guard);
        result
    }
}
