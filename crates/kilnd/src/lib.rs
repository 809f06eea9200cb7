//! The `kilnd` build daemon.
//!
//! `kilnd` keeps a warm process around so that build commands do not pay
//! start-up costs on every invocation. Clients connect over a Unix or TCP
//! socket configured through [`kiln_config`], send a single
//! [`Command`](kiln_daemon_types::Command), optionally stream standard input,
//! and receive log lines followed by exactly one result.
//!
//! Every command runs through the same fixed pipeline (see [`exec`]):
//!
//! 1. close the connection once everything else has finished,
//! 2. give up early if the client has already gone,
//! 3. translate faults into a failure result,
//! 4. serve stop commands,
//! 5. admit the build or answer busy,
//! 6. apply the client's working directory and variables,
//! 7. stream log output back to the client,
//! 8. forward the client's standard input,
//! 9. send the build's result,
//! 10. reset one-time warnings,
//! 11. cancel the build if the client disconnects,
//! 12. run the build.
//!
//! Admission is governed by a single [`DaemonStateCoordinator`]: at most one
//! build runs at a time and concurrent requests are answered with a busy
//! result rather than queued. A broken state machine shuts the daemon down.

mod bootstrap;
mod build;
mod cancel;
pub mod connection;
mod context;
mod environment;
pub mod exec;
mod health;
mod logging;
mod process;
mod services;
mod state;
mod telemetry;
pub mod transport;
mod warnings;

pub use bootstrap::{
    BootstrapError, BuildCollaborators, ConfigLoader, Daemon, StaticConfigLoader,
    SystemConfigLoader, bootstrap_with,
};
pub use build::{BuildEngine, BuildError, BuildOutcome, BuildRequest, ProcessBuildEngine};
pub use cancel::CancellationToken;
pub use context::DaemonContext;
pub use environment::{
    EnvironmentError, EnvironmentOverride, ProcessEnvironment, SystemProcessEnvironment,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use logging::{ClientLogLayer, ClientLogSink, LogRedirection, LogRouter, LogSink};
pub use process::{
    DaemonizeError, Daemonizer, LaunchError, LaunchMode, RuntimeFileError, STOP_SIGNALS,
    ShutdownError, ShutdownSignal, SystemDaemonizer, SystemShutdownSignal, run_daemon,
};
pub use services::DaemonServices;
pub use state::{AdmissionRejection, BuildLease, CoordinatorError, DaemonStateCoordinator};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use warnings::WarningTracker;

#[cfg(test)]
mod tests;
