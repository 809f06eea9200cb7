//! Supervises daemon launch sequencing and runtime orchestration.

use std::env;
use std::sync::Arc;

use tracing::{error, info};

use kiln_config::RuntimePaths;
use kiln_daemon_types::DaemonState;

use crate::bootstrap::{
    BuildCollaborators, ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
use crate::build::ProcessBuildEngine;
use crate::environment::SystemProcessEnvironment;
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::transport::SocketListener;

use super::daemonizer::{Daemonizer, SystemDaemonizer};
use super::errors::LaunchError;
use super::guard::{HealthStatus, ProcessGuard};
use super::shutdown::{ShutdownSignal, SignalWatcher, SystemShutdownSignal};
use super::{CONNECTION_DRAIN_TIMEOUT, FOREGROUND_ENV_VAR, PROCESS_TARGET};

/// Launch mode for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork into the background and detach from the controlling terminal.
    Background,
    /// Remain attached to the terminal; primarily used for debugging and tests.
    Foreground,
}

impl LaunchMode {
    fn detect() -> Self {
        if env::var_os(FOREGROUND_ENV_VAR).is_some() {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Process-level collaborators needed to control daemon lifecycle.
pub(crate) struct ProcessControl<D, S> {
    pub(crate) mode: LaunchMode,
    pub(crate) daemonizer: D,
    pub(crate) shutdown: S,
}

/// Service dependencies required to construct the daemon runtime.
pub(crate) struct ServiceDeps<L> {
    pub(crate) loader: L,
    pub(crate) reporter: Arc<dyn HealthReporter>,
    pub(crate) builds: BuildCollaborators,
}

/// Collaborators required to launch the daemon runtime.
pub(crate) struct LaunchPlan<L, D, S> {
    pub(crate) process: ProcessControl<D, S>,
    pub(crate) services: ServiceDeps<L>,
}

/// Runs the daemon using the production collaborators.
pub fn run_daemon() -> Result<(), LaunchError> {
    let plan = LaunchPlan {
        process: ProcessControl {
            mode: LaunchMode::detect(),
            daemonizer: SystemDaemonizer::new(),
            shutdown: SystemShutdownSignal,
        },
        services: ServiceDeps {
            loader: SystemConfigLoader,
            reporter: Arc::new(StructuredHealthReporter::new()),
            builds: BuildCollaborators {
                engine: Arc::new(ProcessBuildEngine::new()),
                environment: Arc::new(SystemProcessEnvironment),
            },
        },
    };
    run_daemon_with(plan)
}

/// Runs the daemon with injected collaborators.
///
/// Returns once the state machine reaches a terminal state, either because a
/// client sent a stop command or because the shutdown signal fired.
pub(crate) fn run_daemon_with<L, D, S>(plan: LaunchPlan<L, D, S>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    D: Daemonizer,
    S: ShutdownSignal + 'static,
{
    let LaunchPlan { process, services } = plan;
    let ProcessControl {
        mode,
        daemonizer,
        shutdown,
    } = process;
    let ServiceDeps {
        loader,
        reporter,
        builds,
    } = services;

    info!(
        target: PROCESS_TARGET,
        ?mode,
        "starting daemon runtime"
    );
    let config = loader.load()?;
    config.daemon_socket().prepare_filesystem()?;
    let runtime_paths = RuntimePaths::from_config(&config)?;
    let mut guard = ProcessGuard::acquire(runtime_paths)?;
    if matches!(mode, LaunchMode::Background) {
        daemonizer.daemonize(guard.paths())?;
    }
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthStatus::Starting, DaemonState::Idle)?;
    let listener = SocketListener::bind(config.daemon_socket())?;

    let static_loader = StaticConfigLoader::new(config);
    let daemon = bootstrap_with(&static_loader, reporter, builds)?;
    let coordinator = Arc::clone(daemon.coordinator());
    let context = Arc::clone(daemon.context());

    let listener_handle = listener.start(daemon.connection_handler())?;
    guard.write_health(HealthStatus::Ready, coordinator.state())?;
    info!(
        target: PROCESS_TARGET,
        version = context.version(),
        endpoint = %context.endpoint(),
        pid = context.pid(),
        "daemon ready"
    );
    let signals = SignalWatcher::spawn(shutdown, Arc::clone(&coordinator))?;

    let terminal = coordinator.await_terminal();
    guard.write_health(HealthStatus::Stopping, terminal)?;
    listener_handle.shutdown();
    // The stop reply is written after the coordinator turns terminal.
    listener_handle.join_within(CONNECTION_DRAIN_TIMEOUT)?;

    if let Some(source) = signals.failure() {
        return Err(LaunchError::Signals { source });
    }
    if terminal != DaemonState::Stopped {
        error!(
            target: PROCESS_TARGET,
            state = %terminal,
            "state machine broke down; exiting"
        );
        return Err(LaunchError::Coordinator { state: terminal });
    }
    info!(
        target: PROCESS_TARGET,
        state = %terminal,
        uptime_secs = context.uptime().as_secs(),
        "shutdown sequence completed"
    );
    Ok(())
}
