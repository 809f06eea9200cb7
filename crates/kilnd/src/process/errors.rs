//! Errors raised while launching or supervising the daemon process.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTimeError;

use nix::errno::Errno;
use ortho_config::OrthoError;
use thiserror::Error;

use kiln_config::{RuntimePathsError, SocketPreparationError};
use kiln_daemon_types::DaemonState;

use crate::bootstrap::BootstrapError;
use crate::transport::ListenerError;

use super::daemonizer::DaemonizeError;
use super::shutdown::ShutdownError;

/// Why the daemon could not start, or why it ended badly.
///
/// Startup failures leave no runtime files behind. Once the listener runs,
/// the only way out is the coordinator reaching a terminal state; anything
/// other than [`DaemonState::Stopped`] is reported as
/// [`LaunchError::Coordinator`].
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[from]
        source: Arc<OrthoError>,
    },
    /// Preparing the socket directory failed.
    #[error("failed to prepare daemon socket: {source}")]
    Socket {
        /// Underlying filesystem error.
        #[from]
        source: SocketPreparationError,
    },
    /// The runtime directory could not be derived or created.
    #[error("failed to prepare runtime directory: {source}")]
    Runtime {
        /// Underlying path error.
        #[from]
        source: RuntimePathsError,
    },
    /// A live daemon already serves this endpoint.
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning {
        /// PID recorded by the running daemon.
        pid: u32,
    },
    /// A lock, pid or health file could not be maintained.
    #[error(transparent)]
    RuntimeFile(#[from] RuntimeFileError),
    /// Detaching from the terminal failed.
    #[error("failed to daemonise: {source}")]
    Daemonize {
        /// Underlying daemonisation error.
        #[from]
        source: DaemonizeError,
    },
    /// Assembling the daemon services failed.
    #[error("daemon bootstrap failed: {source}")]
    Bootstrap {
        /// Underlying bootstrap error.
        #[from]
        source: BootstrapError,
    },
    /// The socket listener failed to start or stop.
    #[error("daemon socket listener failed: {source}")]
    Listener {
        /// Underlying listener error.
        #[from]
        source: ListenerError,
    },
    /// Watching for stop signals failed.
    #[error("stop signal watcher failed: {source}")]
    Signals {
        /// Underlying watcher error.
        #[from]
        source: ShutdownError,
    },
    /// The coordinator ended in a state other than `Stopped`.
    #[error("daemon state machine ended in the {state} state")]
    Coordinator {
        /// Terminal state reached.
        state: DaemonState,
    },
}

/// Failures maintaining the files that mark a running daemon.
#[derive(Debug, Error)]
pub enum RuntimeFileError {
    /// Creating, writing or removing a runtime file failed.
    #[error("failed to {action} '{path}': {source}")]
    Io {
        /// What was being done to the file.
        action: &'static str,
        /// File concerned.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Probing the pid left by an earlier daemon failed.
    #[error("failed to check existing process {pid}: {source}")]
    Probe {
        /// PID that could not be probed.
        pid: u32,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// A health snapshot was requested before the pid was written.
    #[error("pid must be written before updating health state")]
    MissingPid,
    /// The system clock is before the unix epoch.
    #[error("failed to read system time: {0}")]
    Clock(#[from] SystemTimeError),
    /// The health snapshot could not be serialised.
    #[error("failed to serialise health snapshot: {0}")]
    Serialise(#[from] serde_json::Error),
}

impl RuntimeFileError {
    pub(super) fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}
