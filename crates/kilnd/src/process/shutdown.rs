//! Turns operator signals into coordinator stops.
//!
//! A signal is one of two ways a daemon ends; the other is a client's stop
//! command. Either way the coordinator decides when the daemon is done, so
//! the watcher only asks it to stop and never waits for the outcome.

use std::io;
use std::sync::{Arc, mpsc};
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{error, info};

use crate::state::DaemonStateCoordinator;

use super::PROCESS_TARGET;

/// Signals that stop the daemon.
pub const STOP_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGQUIT, SIGHUP];

/// Blocking source of stop signals.
pub trait ShutdownSignal: Send {
    /// Blocks until a stop signal arrives and returns its number.
    fn wait(&self) -> Result<i32, ShutdownError>;
}

/// Errors raised while watching for stop signals.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The signal stream closed without delivering a signal.
    #[error("signal stream closed before a stop signal arrived")]
    Closed,
    /// The watcher thread could not be started.
    #[error("failed to spawn signal watcher: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Waits for [`STOP_SIGNALS`] through `signal-hook`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<i32, ShutdownError> {
        let mut signals =
            Signals::new(STOP_SIGNALS).map_err(|source| ShutdownError::Install { source })?;
        signals.forever().next().ok_or(ShutdownError::Closed)
    }
}

/// Background thread stopping the coordinator when a signal arrives.
///
/// The thread is detached: a daemon stopped by a client exits without the
/// signal ever firing. A failing signal source also stops the daemon, and
/// the failure is kept for [`SignalWatcher::failure`].
#[derive(Debug)]
pub(crate) struct SignalWatcher {
    failures: mpsc::Receiver<ShutdownError>,
}

impl SignalWatcher {
    pub(crate) fn spawn<S>(
        signal: S,
        coordinator: Arc<DaemonStateCoordinator>,
    ) -> Result<Self, ShutdownError>
    where
        S: ShutdownSignal + 'static,
    {
        let (report, failures) = mpsc::channel();
        thread::Builder::new()
            .name("kilnd-signals".to_owned())
            .spawn(move || {
                match signal.wait() {
                    Ok(number) => info!(
                        target: PROCESS_TARGET,
                        signal = number,
                        "stop signal received"
                    ),
                    Err(failure) => {
                        error!(
                            target: PROCESS_TARGET,
                            error = %failure,
                            "signal watcher failed; stopping the daemon"
                        );
                        drop(report.send(failure));
                    }
                }
                let state = coordinator.request_stop();
                info!(target: PROCESS_TARGET, state = %state, "stop requested by signal watcher");
            })
            .map_err(|source| ShutdownError::Spawn { source })?;
        Ok(Self { failures })
    }

    /// Failure reported by the signal source, if it failed.
    pub(crate) fn failure(&self) -> Option<ShutdownError> {
        self.failures.try_recv().ok()
    }
}
