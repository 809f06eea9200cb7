//! Singleton lock and lifecycle files for a running daemon.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

use kiln_config::RuntimePaths;
use kiln_daemon_types::DaemonState;

use super::PROCESS_TARGET;
use super::errors::{LaunchError, RuntimeFileError};
use super::files::atomic_write;

/// Holds the lock file for as long as the daemon runs.
///
/// Dropping the guard removes the lock, pid and health files.
#[derive(Debug)]
pub(super) struct ProcessGuard {
    paths: RuntimePaths,
    _lock: File,
    pid: Option<u32>,
}

impl ProcessGuard {
    pub(super) fn acquire(paths: RuntimePaths) -> Result<Self, LaunchError> {
        let lock = acquire_lock(&paths)?;
        Ok(Self {
            paths,
            _lock: lock,
            pid: None,
        })
    }

    pub(super) fn write_pid(&mut self, pid: u32) -> Result<(), RuntimeFileError> {
        let path = self.paths.pid_path();
        let mut file = owner_only()
            .open(path)
            .map_err(RuntimeFileError::io("create pid file", path))?;
        writeln!(file, "{pid}")
            .and_then(|()| file.sync_all())
            .map_err(RuntimeFileError::io("write pid file", path))?;
        self.pid = Some(pid);
        info!(
            target: PROCESS_TARGET,
            pid,
            file = %path.display(),
            "pid file written"
        );
        Ok(())
    }

    pub(super) fn write_health(
        &self,
        status: HealthStatus,
        state: DaemonState,
    ) -> Result<(), RuntimeFileError> {
        let pid = self.pid.ok_or(RuntimeFileError::MissingPid)?;
        let snapshot = HealthSnapshot::new(status, pid, state)?;
        let mut payload = serde_json::to_vec(&snapshot)?;
        payload.push(b'\n');
        let path = self.paths.health_path();
        atomic_write(path, &payload).map_err(RuntimeFileError::io("write health snapshot", path))?;
        info!(
            target: PROCESS_TARGET,
            status = snapshot.status,
            state = snapshot.state,
            file = %path.display(),
            "health snapshot updated"
        );
        Ok(())
    }

    pub(super) fn paths(&self) -> &RuntimePaths {
        &self.paths
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for (path, label) in [
            (self.paths.lock_path(), "lock"),
            (self.paths.pid_path(), "pid"),
            (self.paths.health_path(), "health"),
        ] {
            match fs::remove_file(path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => {
                    warn!(
                        target: PROCESS_TARGET,
                        file = %path.display(),
                        kind = label,
                        error = %error,
                        "failed to remove runtime file"
                    );
                }
                _ => {}
            }
        }
    }
}

/// Coarse lifecycle phase published in the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum HealthStatus {
    Starting,
    Ready,
    Stopping,
}

impl HealthStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthSnapshot {
    status: &'static str,
    pid: u32,
    state: &'static str,
    timestamp: u64,
}

impl HealthSnapshot {
    fn new(status: HealthStatus, pid: u32, state: DaemonState) -> Result<Self, RuntimeFileError> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        Ok(Self {
            status: status.as_str(),
            pid,
            state: state.as_str(),
            timestamp,
        })
    }
}

fn owner_only() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn acquire_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(paths.lock_path()) {
        Ok(file) => {
            info!(
                target: PROCESS_TARGET,
                file = %paths.lock_path().display(),
                "acquired daemon lock"
            );
            Ok(file)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => handle_existing_lock(paths),
        Err(source) => Err(RuntimeFileError::io("create lock file", paths.lock_path())(source).into()),
    }
}

fn handle_existing_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    if let Some(pid) = read_pid(paths.pid_path())
        && process_alive(pid)?
    {
        info!(
            target: PROCESS_TARGET,
            pid,
            "refusing to start: existing daemon alive"
        );
        return Err(LaunchError::AlreadyRunning { pid });
    }
    warn!(
        target: PROCESS_TARGET,
        lock = %paths.lock_path().display(),
        "existing daemon not detected; cleaning stale files"
    );
    remove_stale(paths.lock_path())?;
    remove_stale(paths.pid_path())?;
    acquire_lock(paths)
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok()
}

fn remove_stale(path: &Path) -> Result<(), RuntimeFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RuntimeFileError::io("remove stale file", path)(source)),
    }
}

fn process_alive(pid: u32) -> Result<bool, RuntimeFileError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(false);
    };
    if raw == 0 {
        return Ok(false);
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH | Errno::ECHILD) => Ok(false),
        Err(errno) => Err(RuntimeFileError::Probe { pid, source: errno }),
    }
}
