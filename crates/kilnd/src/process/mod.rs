//! Process supervision: singleton locking, daemonisation and shutdown.

use std::time::Duration;

pub(crate) mod daemonizer;
mod errors;
mod files;
mod guard;
pub(crate) mod launch;
pub(crate) mod shutdown;

pub use daemonizer::{DaemonizeError, Daemonizer, SystemDaemonizer};
pub use errors::{LaunchError, RuntimeFileError};
pub use launch::{LaunchMode, run_daemon};
pub use shutdown::{STOP_SIGNALS, ShutdownError, ShutdownSignal, SystemShutdownSignal};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
/// How long a stopping daemon waits for connections to finish replying.
pub(crate) const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const FOREGROUND_ENV_VAR: &str = "KILN_FOREGROUND";
