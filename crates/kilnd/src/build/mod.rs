//! Boundary to the engine that actually performs a build.
//!
//! The pipeline hands an admitted command to a [`BuildEngine`] as a
//! [`BuildRequest`] and blocks until it returns. Engines are expected to poll
//! the request's [`CancellationToken`] and return promptly once it is raised.

mod process;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use kiln_daemon_types::{
    BuildInvocation, CancellationReason, CommandId, FailureDescription, FailureKind,
};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::context::DaemonContext;
use crate::warnings::WarningTracker;

pub use self::process::ProcessBuildEngine;

const BUILD_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::build");

/// Everything an engine receives for one build.
pub struct BuildRequest {
    /// Command being served.
    pub command_id: CommandId,
    /// What to build.
    pub invocation: BuildInvocation,
    /// Identity of the daemon running the build.
    pub context: Arc<DaemonContext>,
    /// Standard input forwarded from the client.
    pub input: Box<dyn Read + Send>,
    /// Raised when the build should stop early.
    pub cancellation: CancellationToken,
    /// One-time warnings for this build.
    pub warnings: Arc<WarningTracker>,
}

impl fmt::Debug for BuildRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BuildRequest")
            .field("command_id", &self.command_id)
            .field("invocation", &self.invocation)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BuildRequest {
    /// Request with no client input, mainly useful to tests and tools.
    #[must_use]
    pub fn without_input(
        command_id: CommandId,
        invocation: BuildInvocation,
        context: Arc<DaemonContext>,
    ) -> Self {
        Self {
            command_id,
            invocation,
            context,
            input: Box::new(io::empty()),
            cancellation: CancellationToken::new(),
            warnings: Arc::new(WarningTracker::default()),
        }
    }
}

/// What the engine reports for a build that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The build succeeded.
    Success {
        /// Engine specific payload passed through to the client.
        payload: serde_json::Value,
    },
    /// The build ran but failed.
    Failure(FailureDescription),
}

impl BuildOutcome {
    /// Build-level failure with a message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(FailureDescription::new(FailureKind::Build, message))
    }
}

/// Faults raised by the engine itself rather than by the build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The invocation named no program.
    #[error("build invocation has no arguments")]
    EmptyInvocation,
    /// The build process could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A standard stream of the build process was not captured.
    #[error("build process {stream} was not captured")]
    MissingStream {
        /// Name of the stream.
        stream: &'static str,
    },
    /// Polling the build process failed.
    #[error("failed to wait for the build process: {source}")]
    Wait {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Terminating a cancelled build failed.
    #[error("failed to terminate the build process: {source}")]
    Kill {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The build stopped because it was cancelled.
    #[error("build cancelled: {reason:?}")]
    Cancelled {
        /// Why the build was cancelled.
        reason: CancellationReason,
    },
}

/// Runs builds on behalf of the daemon.
#[cfg_attr(test, mockall::automock)]
pub trait BuildEngine: Send + Sync {
    /// Runs one build to completion or cancellation.
    fn run_build(&self, request: BuildRequest) -> Result<BuildOutcome, BuildError>;
}
