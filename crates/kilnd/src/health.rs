//! Structured health reporting for daemon lifecycle events.

use std::sync::Arc;

use kiln_config::Config;
use kiln_daemon_types::DaemonState;

use crate::bootstrap::BootstrapError;
use crate::state::CoordinatorError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked after the daemon state machine changed state.
    fn state_changed(&self, from: DaemonState, to: DaemonState);

    /// Invoked when the state machine detects an internal inconsistency.
    fn coordinator_failed(&self, error: &CoordinatorError);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn state_changed(&self, from: DaemonState, to: DaemonState) {
        (**self).state_changed(from, to);
    }

    fn coordinator_failed(&self, error: &CoordinatorError) {
        (**self).coordinator_failed(error);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            socket = %config.daemon_socket(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            client_log_level = %config.client_log_level(),
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn state_changed(&self, from: DaemonState, to: DaemonState) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "state_changed",
            from = %from,
            to = %to,
            "daemon state changed"
        );
    }

    fn coordinator_failed(&self, error: &CoordinatorError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "coordinator_failed",
            error = %error,
            "daemon state machine is broken; the daemon will shut down"
        );
    }
}
