//! Identity of the running daemon process.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use kiln_config::SocketEndpoint;

/// Immutable description of this daemon, shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonContext {
    pid: u32,
    started_at: SystemTime,
    endpoint: SocketEndpoint,
    runtime_dir: PathBuf,
    version: &'static str,
}

impl DaemonContext {
    /// Captures the context for the current process.
    #[must_use]
    pub fn current(endpoint: SocketEndpoint, runtime_dir: impl Into<PathBuf>) -> Self {
        Self::new(std::process::id(), SystemTime::now(), endpoint, runtime_dir)
    }

    /// Builds a context from explicit parts.
    #[must_use]
    pub fn new(
        pid: u32,
        started_at: SystemTime,
        endpoint: SocketEndpoint,
        runtime_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pid,
            started_at,
            endpoint,
            runtime_dir: runtime_dir.into(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Process id of the daemon.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Time elapsed since start, or zero if the clock went backwards.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }

    /// Endpoint the daemon accepts connections on.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Directory holding the daemon's runtime artefacts.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Daemon version string.
    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }
}
