//! Daemon bootstrap orchestration.

use std::str::FromStr;
use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::Level;
use tracing::metadata::ParseLevelError;

use kiln_config::{Config, RuntimePaths, RuntimePathsError, SocketPreparationError};

use crate::build::BuildEngine;
use crate::context::DaemonContext;
use crate::environment::ProcessEnvironment;
use crate::exec::{DaemonConnectionHandler, DefaultCommandExecuter};
use crate::health::HealthReporter;
use crate::logging::LogRouter;
use crate::services::DaemonServices;
use crate::state::DaemonStateCoordinator;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};
use crate::warnings::WarningTracker;

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a configuration resolved earlier.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already resolved configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// The client log level is not a tracing level.
    #[error("invalid client log level '{value}': {source}")]
    ClientLogLevel {
        /// Configured value.
        value: String,
        /// Underlying parse error.
        #[source]
        source: ParseLevelError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// Socket preparation failed.
    #[error("failed to prepare daemon socket: {source}")]
    Socket {
        /// Filesystem error reported while preparing the socket directory.
        #[source]
        source: SocketPreparationError,
    },
    /// The runtime directory could not be derived or created.
    #[error("failed to prepare runtime directory: {source}")]
    Runtime {
        /// Underlying path error.
        #[source]
        source: RuntimePathsError,
    },
}

/// Collaborators that decide how builds are run.
pub struct BuildCollaborators {
    /// Engine running builds.
    pub engine: Arc<dyn BuildEngine>,
    /// Process working directory and variables.
    pub environment: Arc<dyn ProcessEnvironment>,
}

/// Result of a successful bootstrap invocation.
pub struct Daemon {
    config: Config,
    services: DaemonServices,
    telemetry: TelemetryHandle,
}

impl Daemon {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Services shared by every command.
    #[must_use]
    pub fn services(&self) -> &DaemonServices {
        &self.services
    }

    /// The daemon-wide state machine.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DaemonStateCoordinator> {
        &self.services.coordinator
    }

    /// Identity of this daemon.
    #[must_use]
    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.services.context
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Builds the handler serving accepted connections.
    #[must_use]
    pub fn connection_handler(&self) -> Arc<DaemonConnectionHandler> {
        let executer = Arc::new(DefaultCommandExecuter::new(self.services.clone()));
        Arc::new(DaemonConnectionHandler::new(executer))
    }
}

/// Bootstraps the daemon using the supplied collaborators.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    collaborators: BuildCollaborators,
) -> Result<Daemon, BootstrapError> {
    reporter.bootstrap_starting();
    match assemble(loader, Arc::clone(&reporter), collaborators) {
        Ok(daemon) => {
            reporter.bootstrap_succeeded(daemon.config());
            Ok(daemon)
        }
        Err(error) => {
            reporter.bootstrap_failed(&error);
            Err(error)
        }
    }
}

fn assemble(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    collaborators: BuildCollaborators,
) -> Result<Daemon, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let threshold = Level::from_str(config.client_log_level()).map_err(|source| {
        BootstrapError::ClientLogLevel {
            value: config.client_log_level().to_owned(),
            source,
        }
    })?;
    let log_router = LogRouter::new(threshold);
    let telemetry = telemetry::initialise(&config, &log_router)
        .map_err(|source| BootstrapError::Telemetry { source })?;
    config
        .daemon_socket()
        .prepare_filesystem()
        .map_err(|source| BootstrapError::Socket { source })?;
    let runtime =
        RuntimePaths::from_config(&config).map_err(|source| BootstrapError::Runtime { source })?;

    let services = DaemonServices {
        context: Arc::new(DaemonContext::current(
            config.daemon_socket().clone(),
            runtime.runtime_dir(),
        )),
        coordinator: Arc::new(DaemonStateCoordinator::new(reporter)),
        engine: collaborators.engine,
        environment: collaborators.environment,
        log_router,
        warnings: Arc::new(WarningTracker::new()),
    };
    Ok(Daemon {
        config,
        services,
        telemetry,
    })
}
