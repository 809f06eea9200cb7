//! Detaches `kilnd` from its controlling terminal.
//!
//! A detached daemon has no terminal for its local logs, so stdout and stderr
//! are appended to the runtime log file beside the socket. Stdin is left on
//! `/dev/null`; build input only ever arrives over client connections.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use daemonize_me::Daemon;
use thiserror::Error;
use tracing::info;

use kiln_config::RuntimePaths;

use super::PROCESS_TARGET;

/// Abstraction over daemonisation strategies.
pub trait Daemonizer: Send + Sync {
    /// Detaches the process into the background.
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError>;
}

/// Errors surfaced while detaching the daemon.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    /// The runtime log file could not be opened for the detached streams.
    #[error("failed to open daemon log '{path}': {source}")]
    LogFile {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Forking or detaching from the session failed.
    #[error("failed to detach from the terminal: {0}")]
    Detach(#[from] daemonize_me::DaemonError),
}

/// Daemoniser that delegates to `daemonize-me`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDaemonizer;

impl SystemDaemonizer {
    /// Builds a new system daemoniser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Daemonizer for SystemDaemonizer {
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError> {
        let stdout = open_log(paths.log_path())?;
        let stderr = stdout
            .try_clone()
            .map_err(|source| DaemonizeError::LogFile {
                path: paths.log_path().to_path_buf(),
                source,
            })?;
        info!(
            target: PROCESS_TARGET,
            runtime = %paths.runtime_dir().display(),
            log = %paths.log_path().display(),
            "detaching; local logs continue in the runtime log file"
        );
        Daemon::new()
            .work_dir(paths.runtime_dir())
            .stdout(stdout)
            .stderr(stderr)
            .name(OsStr::new(env!("CARGO_PKG_NAME")))
            .start()?;
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File, DaemonizeError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|source| DaemonizeError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}
