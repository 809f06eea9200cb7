//! Accepts a connection and routes its command into the pipeline.

use std::sync::Arc;

use kiln_daemon_types::{
    ClientMessage, CommandId, CommandOutcome, CommandResult, DaemonMessage, FailureKind,
};
use tracing::{debug, error, warn};

use super::{CommandExecuter, EXEC_TARGET};
use crate::connection::{Connection, StreamConnection};
use crate::transport::{ConnectionHandler, ConnectionStream};

/// Identifier used when answering a connection that never sent a command.
pub const UNIDENTIFIED_COMMAND: &str = "unidentified";

/// [`ConnectionHandler`] reading one command per connection.
///
/// The first frame must be a command. Anything else is answered with a
/// daemon failure and the connection is closed.
pub struct DaemonConnectionHandler {
    executer: Arc<dyn CommandExecuter>,
}

impl DaemonConnectionHandler {
    /// Creates a handler delegating to `executer`.
    #[must_use]
    pub fn new(executer: Arc<dyn CommandExecuter>) -> Self {
        Self { executer }
    }

    /// Serves an already framed connection.
    pub fn serve(&self, connection: Arc<dyn Connection>) {
        let command = match connection.receive() {
            Ok(Some(ClientMessage::Command(command))) => command,
            Ok(Some(_)) => {
                reject(
                    connection.as_ref(),
                    "the first message on a connection must be a command",
                );
                return;
            }
            Ok(None) => {
                debug!(
                    target: EXEC_TARGET,
                    "client closed the connection without sending a command"
                );
                connection.close();
                return;
            }
            Err(error) => {
                reject(connection.as_ref(), &error.to_string());
                return;
            }
        };
        if let Err(error) = self.executer.execute_command(connection, command) {
            error!(
                target: EXEC_TARGET,
                error = %error,
                "command pipeline ended with an unhandled fault"
            );
        }
    }
}

impl ConnectionHandler for DaemonConnectionHandler {
    fn handle(&self, stream: ConnectionStream) {
        match StreamConnection::new(stream) {
            Ok(connection) => self.serve(Arc::new(connection)),
            Err(error) => warn!(
                target: EXEC_TARGET,
                error = %error,
                "failed to prepare connection"
            ),
        }
    }
}

fn reject(connection: &dyn Connection, reason: &str) {
    warn!(target: EXEC_TARGET, reason, "rejecting malformed connection");
    let message = DaemonMessage::Result(CommandResult::new(
        CommandId::new(UNIDENTIFIED_COMMAND),
        CommandOutcome::failure(FailureKind::Daemon, reason),
    ));
    if let Err(error) = connection.dispatch(&message) {
        debug!(target: EXEC_TARGET, error = %error, "failed to send rejection");
    }
    connection.close();
}
