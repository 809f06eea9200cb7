//! Assembles the pipeline and runs commands through it.

use std::sync::Arc;

use kiln_daemon_types::Command;
use tracing::{error, info_span};

use super::actions::{
    AbortIfClientDisconnected, CatchAndForwardFailure, CloseConnectionAfterExecution,
    EstablishBuildEnvironment, ExecuteBuild, ForwardClientInput, HandleStop, LogToClient,
    ResetWarnings, ReturnResult, StartBuildOrRespondWithBusy, WatchForDisconnection,
};
use super::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};
use crate::connection::{Connection, DisconnectAwareConnection};
use crate::services::DaemonServices;

/// Runs a command received on a connection to completion.
pub trait CommandExecuter: Send + Sync {
    /// Serves `command`, closing `connection` before returning.
    fn execute_command(
        &self,
        connection: Arc<dyn Connection>,
        command: Command,
    ) -> Result<(), ActionError>;
}

/// Executer running the fixed daemon pipeline.
pub struct DefaultCommandExecuter {
    services: DaemonServices,
    actions: Vec<Arc<dyn CommandAction>>,
}

impl DefaultCommandExecuter {
    /// Creates an executer with the standard twelve stages.
    #[must_use]
    pub fn new(services: DaemonServices) -> Self {
        let actions = Self::create_actions(&services);
        Self { services, actions }
    }

    /// Creates an executer with a caller supplied pipeline.
    #[must_use]
    pub fn with_actions(services: DaemonServices, actions: Vec<Arc<dyn CommandAction>>) -> Self {
        Self { services, actions }
    }

    /// The standard pipeline, outermost stage first.
    #[must_use]
    pub fn create_actions(services: &DaemonServices) -> Vec<Arc<dyn CommandAction>> {
        vec![
            Arc::new(CloseConnectionAfterExecution),
            Arc::new(AbortIfClientDisconnected),
            Arc::new(CatchAndForwardFailure),
            Arc::new(HandleStop),
            Arc::new(StartBuildOrRespondWithBusy),
            Arc::new(EstablishBuildEnvironment::new(Arc::clone(
                &services.environment,
            ))),
            Arc::new(LogToClient::new(services.log_router.clone())),
            Arc::new(ForwardClientInput),
            Arc::new(ReturnResult),
            Arc::new(ResetWarnings::new(Arc::clone(&services.warnings))),
            Arc::new(WatchForDisconnection),
            Arc::new(ExecuteBuild::new(
                Arc::clone(&services.engine),
                Arc::clone(&services.warnings),
            )),
        ]
    }

    /// Shared services the pipeline runs against.
    #[must_use]
    pub fn services(&self) -> &DaemonServices {
        &self.services
    }
}

impl CommandExecuter for DefaultCommandExecuter {
    fn execute_command(
        &self,
        connection: Arc<dyn Connection>,
        command: Command,
    ) -> Result<(), ActionError> {
        let span = info_span!(
            target: EXEC_TARGET,
            "command",
            id = %command.id,
            kind = command.label()
        );
        let _entered = span.enter();

        let decorated = match DisconnectAwareConnection::new(Arc::clone(&connection)) {
            Ok(decorated) => Arc::new(decorated),
            Err(source) => {
                error!(
                    target: EXEC_TARGET,
                    error = %source,
                    "failed to start the disconnect listener; dropping connection"
                );
                connection.close();
                return Err(ActionError::Watch { source });
            }
        };
        let mut execution = CommandExecution::new(
            decorated,
            command,
            Arc::clone(&self.services.context),
            Arc::clone(&self.services.coordinator),
        );
        Next::new(&self.actions).proceed(&mut execution)
    }
}
