//! Frames exchanged on a daemon connection.

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandId};
use crate::state::DaemonState;

/// Frames sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The command opening a conversation. Sent exactly once per connection.
    Command(Command),
    /// Bytes for the build's standard input.
    Input {
        /// Raw input bytes.
        data: Vec<u8>,
    },
    /// Signals that no further input follows.
    CloseInput,
}

/// Frames sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// A log line produced while the client's build runs.
    Log(LogRecord),
    /// The single terminal result for the client's command.
    Result(CommandResult),
}

/// Log output forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogRecord {
    /// Lower-case level name (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Originating tracing target.
    pub target: String,
    /// Rendered message text.
    pub message: String,
}

/// Outcome of a command tagged with the command's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandResult {
    /// Identifier of the command this result answers.
    pub id: CommandId,
    /// What happened.
    pub outcome: CommandOutcome,
}

impl CommandResult {
    /// Pairs an outcome with its command identifier.
    #[must_use]
    pub const fn new(id: CommandId, outcome: CommandOutcome) -> Self {
        Self { id, outcome }
    }
}

/// Every way a command can finish.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The build finished successfully.
    Success {
        /// Engine specific payload.
        payload: serde_json::Value,
    },
    /// The build or the daemon failed.
    Failure(FailureDescription),
    /// The daemon could not admit the command.
    Busy {
        /// State observed when admission was refused.
        state: DaemonState,
    },
    /// The build was cancelled before completing.
    Cancelled {
        /// Why the build was cancelled.
        reason: CancellationReason,
    },
    /// A stop request was accepted.
    Stopped,
}

impl CommandOutcome {
    /// Builds a failure outcome.
    #[must_use]
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(FailureDescription::new(kind, message))
    }

    /// Short status label used in logs.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure(_) => "failure",
            Self::Busy { .. } => "busy",
            Self::Cancelled { .. } => "cancelled",
            Self::Stopped => "stopped",
        }
    }
}

/// Wire-safe description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailureDescription {
    /// Which layer failed.
    pub kind: FailureKind,
    /// Top level message.
    pub message: String,
    /// Messages of underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl FailureDescription {
    /// Creates a description without causes.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Describes an error and its chain of sources.
    #[must_use]
    pub fn from_error(kind: FailureKind, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind,
            message: error.to_string(),
            causes,
        }
    }
}

/// Layer a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The build engine reported a failed build.
    Build,
    /// The build engine itself faulted.
    Engine,
    /// A daemon-side handler faulted.
    Daemon,
}

/// Reasons a build may be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// The client went away mid-build.
    ClientDisconnected,
    /// A stop command or shutdown signal arrived.
    DaemonStopping,
}
