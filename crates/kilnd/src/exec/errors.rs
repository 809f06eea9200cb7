//! Faults raised inside the pipeline.

use std::any::Any;
use std::io;

use kiln_daemon_types::CommandId;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::environment::EnvironmentError;

/// Errors an action can raise. All of them are recoverable at the pipeline
/// level: the failure stage turns them into a failure result.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Talking to the client failed for a reason other than disconnection.
    #[error("connection failed: {source}")]
    Connection {
        /// Underlying connection error.
        #[from]
        source: ConnectionError,
    },
    /// A second result was produced for the same command.
    #[error("a result for command {command} was already dispatched")]
    ResultAlreadyDispatched {
        /// Command that already has a result.
        command: CommandId,
    },
    /// The build environment could not be applied.
    #[error("failed to establish the build environment: {source}")]
    Environment {
        /// Underlying environment error.
        #[from]
        source: EnvironmentError,
    },
    /// The disconnect listener could not be started.
    #[error("failed to start the disconnect listener: {source}")]
    Watch {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Standard input forwarding could not be set up.
    #[error("failed to forward client input: {source}")]
    InputForwarding {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A downstream stage panicked.
    #[error("pipeline stage panicked: {message}")]
    Panicked {
        /// Rendered panic payload.
        message: String,
    },
    /// A build stage ran for a command that carries no build invocation.
    #[error("command {command} reached a build stage without a build invocation")]
    MissingInvocation {
        /// Offending command.
        command: CommandId,
    },
    /// The build stage finished without producing an outcome.
    #[error("command {command} finished without producing a result")]
    MissingOutcome {
        /// Offending command.
        command: CommandId,
    },
}

/// Renders a `catch_unwind` payload for logs and failure results.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
