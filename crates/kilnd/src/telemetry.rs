//! Structured telemetry initialisation for the daemon.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use kiln_config::{Config, LogFormat};

use crate::logging::LogRouter;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber the first time it is called.
///
/// Local output goes to stderr as JSON or compact text, filtered by the
/// configured expression. The router's layer carries its own level filter at
/// the client log level, so a client sees its build's output even when the
/// daemon logs little locally. Later calls return a fresh handle and leave
/// the installed subscriber, and its router, in place.
pub fn initialise(
    config: &Config,
    router: &LogRouter,
) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config, router))
        .map(|()| TelemetryHandle)
}

fn install_subscriber(config: &Config, router: &LogRouter) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let local = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());
    let local: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format() {
        LogFormat::Json => local.json().flatten_event(true).with_filter(filter).boxed(),
        LogFormat::Compact => local.compact().with_filter(filter).boxed(),
    };
    let client = router
        .layer()
        .with_filter(LevelFilter::from_level(router.threshold()));

    let subscriber = tracing_subscriber::registry().with(local).with(client);
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
