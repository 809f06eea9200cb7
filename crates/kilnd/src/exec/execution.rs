//! Per-command state threaded through the pipeline.

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use kiln_daemon_types::{Command, CommandOutcome, CommandResult, DaemonMessage};
use tracing::debug;

use super::{ActionError, EXEC_TARGET};
use crate::cancel::CancellationToken;
use crate::connection::{Connection, ConnectionError, DisconnectAwareConnection};
use crate::context::DaemonContext;
use crate::state::DaemonStateCoordinator;

/// Whether a dispatched result reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The result was written to the connection.
    Delivered,
    /// The client had already gone; the result was dropped.
    ClientDisconnected,
}

/// Mutable context for one command, owned by the pipeline thread.
///
/// Other threads never touch it directly. The disconnect watcher reaches
/// the build only through the shared [`CancellationToken`].
pub struct CommandExecution {
    connection: Arc<DisconnectAwareConnection>,
    command: Command,
    daemon_context: Arc<DaemonContext>,
    coordinator: Arc<DaemonStateCoordinator>,
    cancellation: CancellationToken,
    build_input: Option<Box<dyn Read + Send>>,
    outcome: Option<CommandOutcome>,
    result_dispatched: bool,
}

impl fmt::Debug for CommandExecution {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CommandExecution")
            .field("command", &self.command)
            .field("outcome", &self.outcome)
            .field("result_dispatched", &self.result_dispatched)
            .finish_non_exhaustive()
    }
}

impl CommandExecution {
    /// Creates the context for `command` arriving on `connection`.
    #[must_use]
    pub fn new(
        connection: Arc<DisconnectAwareConnection>,
        command: Command,
        daemon_context: Arc<DaemonContext>,
        coordinator: Arc<DaemonStateCoordinator>,
    ) -> Self {
        Self {
            connection,
            command,
            daemon_context,
            coordinator,
            cancellation: CancellationToken::new(),
            build_input: None,
            outcome: None,
            result_dispatched: false,
        }
    }

    /// The client connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<DisconnectAwareConnection> {
        &self.connection
    }

    /// The command being served.
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Identity of this daemon.
    #[must_use]
    pub fn daemon_context(&self) -> &Arc<DaemonContext> {
        &self.daemon_context
    }

    /// The daemon-wide state machine.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DaemonStateCoordinator> {
        &self.coordinator
    }

    /// Token cancelling this command's build.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Adopts the token of the build lease granted to this command.
    pub fn set_cancellation(&mut self, cancellation: CancellationToken) {
        self.cancellation = cancellation;
    }

    /// Installs the stream the build reads as standard input.
    pub fn set_build_input(&mut self, input: Box<dyn Read + Send>) {
        self.build_input = Some(input);
    }

    /// Takes the build's input stream, leaving none behind.
    pub fn take_build_input(&mut self) -> Option<Box<dyn Read + Send>> {
        self.build_input.take()
    }

    /// Records the outcome to send once the pipeline unwinds.
    pub fn set_outcome(&mut self, outcome: CommandOutcome) {
        self.outcome = Some(outcome);
    }

    /// Takes the recorded outcome.
    pub fn take_outcome(&mut self) -> Option<CommandOutcome> {
        self.outcome.take()
    }

    /// Returns `true` once a result was dispatched.
    #[must_use]
    pub const fn result_dispatched(&self) -> bool {
        self.result_dispatched
    }

    /// Sends the command's single result.
    ///
    /// A second call fails without writing anything. A result that cannot
    /// be delivered because the client left still counts as dispatched.
    pub fn dispatch_result(&mut self, outcome: CommandOutcome) -> Result<Delivery, ActionError> {
        if self.result_dispatched {
            return Err(ActionError::ResultAlreadyDispatched {
                command: self.command.id.clone(),
            });
        }
        self.result_dispatched = true;
        let status = outcome.status();
        let message = DaemonMessage::Result(CommandResult::new(self.command.id.clone(), outcome));
        match self.connection.dispatch(&message) {
            Ok(()) => {
                debug!(target: EXEC_TARGET, status, "result dispatched");
                Ok(Delivery::Delivered)
            }
            Err(ConnectionError::Disconnected) => {
                debug!(target: EXEC_TARGET, status, "client gone; result dropped");
                Ok(Delivery::ClientDisconnected)
            }
            Err(source) => Err(ActionError::Connection { source }),
        }
    }
}
