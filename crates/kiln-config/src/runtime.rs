//! Runtime artefact layout shared by the daemon and its clients.
//!
//! The lock, pid, health and log files live next to the Unix socket, or in a
//! per-port directory under the user's runtime directory for TCP endpoints.
//! The log file outlives the daemon; the others are removed on exit.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Config, SocketEndpoint};

/// Canonical locations of runtime artefacts written by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
    log_path: PathBuf,
}

impl RuntimePaths {
    /// Derives the layout from the configuration and creates the directory.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let runtime_dir = runtime_directory(config.daemon_socket())?;
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self::in_directory(runtime_dir))
    }

    /// Lays out the artefacts inside an existing directory.
    #[must_use]
    pub fn in_directory(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        Self {
            lock_path: runtime_dir.join("kilnd.lock"),
            pid_path: runtime_dir.join("kilnd.pid"),
            health_path: runtime_dir.join("kilnd.health"),
            log_path: runtime_dir.join("kilnd.log"),
            runtime_dir,
        }
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Lock file guarding against a second daemon on the same endpoint.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// File recording the daemon's process id.
    #[must_use]
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// File holding the latest health snapshot.
    #[must_use]
    pub fn health_path(&self) -> &Path {
        &self.health_path
    }

    /// File receiving a detached daemon's stdout and stderr.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn runtime_directory(endpoint: &SocketEndpoint) -> Result<PathBuf, RuntimePathsError> {
    match endpoint {
        SocketEndpoint::Unix { path } => path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .map(|parent| parent.as_std_path().to_path_buf())
            .ok_or_else(|| RuntimePathsError::MissingSocketParent {
                path: path.to_string(),
            }),
        SocketEndpoint::Tcp { port, .. } => Ok(user_runtime_base().join(format!("tcp-{port}"))),
    }
}

#[cfg(unix)]
fn user_runtime_base() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join("kiln");
    }
    let uid = unsafe { libc::geteuid() };
    std::env::temp_dir().join("kiln").join(format!("uid-{uid}"))
}

#[cfg(not(unix))]
fn user_runtime_base() -> PathBuf {
    std::env::temp_dir().join("kiln")
}

/// Errors raised while deriving daemon runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// The socket path lacked a parent directory.
    #[error("socket path '{path}' has no parent directory")]
    MissingSocketParent { path: String },
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
