//! Test double for [`HealthReporter`] that records lifecycle events.

use std::sync::Mutex;

use kiln_config::Config;
use kiln_daemon_types::DaemonState;

use crate::bootstrap::BootstrapError;
use crate::health::HealthReporter;
use crate::state::CoordinatorError;

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// Bootstrap completed successfully.
    BootstrapSucceeded,
    /// Bootstrap failed with an error description.
    BootstrapFailed(String),
    /// The state machine moved between states.
    StateChanged(DaemonState, DaemonState),
    /// The state machine broke down.
    CoordinatorFailed(CoordinatorError),
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// State transitions in the order they were published.
    #[must_use]
    pub fn transitions(&self) -> Vec<(DaemonState, DaemonState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HealthEvent::StateChanged(from, to) => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if the daemon ever entered `state`.
    #[must_use]
    pub fn entered(&self, state: DaemonState) -> bool {
        self.transitions().iter().any(|(_, to)| *to == state)
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn state_changed(&self, from: DaemonState, to: DaemonState) {
        self.record(HealthEvent::StateChanged(from, to));
    }

    fn coordinator_failed(&self, error: &CoordinatorError) {
        self.record(HealthEvent::CoordinatorFailed(error.clone()));
    }
}
