//! Daemon-wide state machine serialising build admission.
//!
//! One [`DaemonStateCoordinator`] exists per daemon process and is shared by
//! every connection thread. All reads and transitions go through a single
//! mutex whose critical sections never block, so a second client learns that
//! the daemon is busy immediately even while a long build runs.
//!
//! ```text
//! Idle ──start_build──▶ Busy ──lease dropped──▶ Idle
//!   │                    │
//!   └──request_stop──▶ Stopping ──lease dropped──▶ Stopped
//! any ──internal fault──▶ Broken
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kiln_daemon_types::{CancellationReason, CommandId, DaemonState};
use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::health::HealthReporter;

const STATE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::state");

/// Admission refused because the daemon was not idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("daemon cannot admit a build while {state}")]
pub struct AdmissionRejection {
    /// State observed when admission was attempted.
    pub state: DaemonState,
}

/// Internal inconsistencies that break the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// A thread panicked while holding the state lock.
    #[error("state lock poisoned by a panicking thread")]
    Poisoned,
    /// A build finished while the daemon was not running one.
    #[error("build for command {command} finished while the daemon was {state}")]
    UnexpectedFinish {
        /// Command whose lease was released.
        command: CommandId,
        /// State at the time of release.
        state: DaemonState,
    },
    /// A lease was released for a build that is not the active one.
    #[error("lease for command {command} does not match the active build")]
    LeaseMismatch {
        /// Command whose lease was released.
        command: CommandId,
    },
}

#[derive(Debug, Default)]
struct Machine {
    state: DaemonState,
    active: Option<ActiveBuild>,
}

#[derive(Debug)]
struct ActiveBuild {
    command: CommandId,
    cancellation: CancellationToken,
}

type Transitions = Vec<(DaemonState, DaemonState)>;

/// Shared state machine guarding the single build slot.
pub struct DaemonStateCoordinator {
    machine: Mutex<Machine>,
    changed: Condvar,
    reporter: Arc<dyn HealthReporter>,
}

impl fmt::Debug for DaemonStateCoordinator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DaemonStateCoordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DaemonStateCoordinator {
    /// Creates an idle coordinator reporting transitions to `reporter`.
    #[must_use]
    pub fn new(reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            machine: Mutex::new(Machine::default()),
            changed: Condvar::new(),
            reporter,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DaemonState {
        self.lock()
            .map_or(DaemonState::Broken, |machine| machine.state)
    }

    /// Attempts the `Idle → Busy` transition for `command`.
    ///
    /// The returned lease keeps the daemon busy until it is dropped.
    pub fn start_build(
        self: &Arc<Self>,
        command: &CommandId,
    ) -> Result<BuildLease, AdmissionRejection> {
        let mut machine = self.lock().map_err(|_| AdmissionRejection {
            state: DaemonState::Broken,
        })?;
        if machine.state != DaemonState::Idle {
            return Err(AdmissionRejection {
                state: machine.state,
            });
        }
        let cancellation = CancellationToken::new();
        machine.active = Some(ActiveBuild {
            command: command.clone(),
            cancellation: cancellation.clone(),
        });
        machine.state = DaemonState::Busy;
        drop(machine);

        debug!(target: STATE_TARGET, command = %command, "build admitted");
        self.publish(&[(DaemonState::Idle, DaemonState::Busy)]);
        Ok(BuildLease {
            coordinator: Arc::clone(self),
            command: command.clone(),
            cancellation,
        })
    }

    /// Moves the daemon towards `Stopped`, returning the resulting state.
    ///
    /// An idle daemon stops at once. A busy daemon has its build cancelled
    /// and enters `Stopping`; it reaches `Stopped` when the build's lease is
    /// released. The call never waits for the build.
    pub fn request_stop(&self) -> DaemonState {
        let Ok(mut machine) = self.lock() else {
            return DaemonState::Broken;
        };
        let mut transitions = Transitions::new();
        match machine.state {
            DaemonState::Idle => {
                transitions.push((DaemonState::Idle, DaemonState::Stopping));
                transitions.push((DaemonState::Stopping, DaemonState::Stopped));
                machine.state = DaemonState::Stopped;
            }
            DaemonState::Busy => {
                if let Some(active) = &machine.active {
                    active.cancellation.cancel(CancellationReason::DaemonStopping);
                    info!(
                        target: STATE_TARGET,
                        command = %active.command,
                        "stop requested; cancelling active build"
                    );
                }
                transitions.push((DaemonState::Busy, DaemonState::Stopping));
                machine.state = DaemonState::Stopping;
            }
            DaemonState::Stopping | DaemonState::Stopped | DaemonState::Broken => {}
        }
        let state = machine.state;
        drop(machine);
        self.publish(&transitions);
        state
    }

    /// Raises the active build's cancellation token.
    ///
    /// Returns `true` if a build was running and this call cancelled it.
    pub fn cancel_build(&self, reason: CancellationReason) -> bool {
        self.lock().is_ok_and(|machine| {
            machine
                .active
                .as_ref()
                .is_some_and(|active| active.cancellation.cancel(reason))
        })
    }

    /// Blocks until the daemon reaches `Stopped` or `Broken`.
    pub fn await_terminal(&self) -> DaemonState {
        let Ok(mut machine) = self.lock() else {
            return DaemonState::Broken;
        };
        while !machine.state.is_terminal() {
            machine = match self.changed.wait(machine) {
                Ok(machine) => machine,
                Err(_) => return DaemonState::Broken,
            };
        }
        machine.state
    }

    /// Like [`await_terminal`](Self::await_terminal) but gives up after `timeout`.
    pub fn await_terminal_timeout(&self, timeout: Duration) -> Option<DaemonState> {
        let deadline = Instant::now() + timeout;
        let Ok(mut machine) = self.lock() else {
            return Some(DaemonState::Broken);
        };
        while !machine.state.is_terminal() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            machine = match self.changed.wait_timeout(machine, remaining) {
                Ok((machine, _)) => machine,
                Err(_) => return Some(DaemonState::Broken),
            };
        }
        Some(machine.state)
    }

    fn finish_build(&self, command: &CommandId) {
        let Ok(mut machine) = self.lock() else {
            return;
        };
        let owns_slot = machine
            .active
            .as_ref()
            .is_some_and(|active| &active.command == command);
        let from = machine.state;
        let next = match (from, owns_slot) {
            (DaemonState::Busy, true) => DaemonState::Idle,
            (DaemonState::Stopping, true) => DaemonState::Stopped,
            (DaemonState::Broken, _) => {
                machine.active = None;
                return;
            }
            (state, true) => {
                drop(machine);
                self.break_down(CoordinatorError::UnexpectedFinish {
                    command: command.clone(),
                    state,
                });
                return;
            }
            (_, false) => {
                drop(machine);
                self.break_down(CoordinatorError::LeaseMismatch {
                    command: command.clone(),
                });
                return;
            }
        };
        machine.active = None;
        machine.state = next;
        drop(machine);

        debug!(target: STATE_TARGET, command = %command, "build released");
        self.publish(&[(from, next)]);
    }

    fn break_down(&self, error: CoordinatorError) {
        let from = match self.machine.lock() {
            Ok(mut machine) => Self::force_broken(&mut machine),
            Err(poisoned) => {
                let mut machine = poisoned.into_inner();
                let from = Self::force_broken(&mut machine);
                drop(machine);
                self.machine.clear_poison();
                from
            }
        };
        self.publish(&[(from, DaemonState::Broken)]);
        self.reporter.coordinator_failed(&error);
    }

    fn force_broken(machine: &mut Machine) -> DaemonState {
        if let Some(active) = machine.active.take() {
            active.cancellation.cancel(CancellationReason::DaemonStopping);
        }
        std::mem::replace(&mut machine.state, DaemonState::Broken)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Machine>, CoordinatorError> {
        match self.machine.lock() {
            Ok(machine) => Ok(machine),
            Err(poisoned) => {
                drop(poisoned);
                self.break_down(CoordinatorError::Poisoned);
                Err(CoordinatorError::Poisoned)
            }
        }
    }

    fn publish(&self, transitions: &[(DaemonState, DaemonState)]) {
        if transitions.is_empty() {
            return;
        }
        self.changed.notify_all();
        for (from, to) in transitions {
            if from != to {
                self.reporter.state_changed(*from, *to);
            }
        }
    }
}

/// Proof that the holder owns the daemon's single build slot.
///
/// Dropping the lease releases the slot: `Busy → Idle`, or
/// `Stopping → Stopped` when a stop arrived during the build.
#[derive(Debug)]
pub struct BuildLease {
    coordinator: Arc<DaemonStateCoordinator>,
    command: CommandId,
    cancellation: CancellationToken,
}

impl BuildLease {
    /// Command that owns the slot.
    #[must_use]
    pub fn command(&self) -> &CommandId {
        &self.command
    }

    /// Token raised when the build should stop early.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        self.coordinator.finish_build(&self.command);
    }
}
