//! Harness running commands through the pipeline over in-memory connections.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{Dispatch, Level};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::SubscriberExt;

use kiln_config::SocketEndpoint;
use kiln_daemon_types::{BuildInvocation, CancellationReason, Command, CommandOutcome};

use crate::build::{BuildEngine, BuildError, BuildOutcome, MockBuildEngine};
use crate::connection::test_support::{ChannelConnection, ClientEnd};
use crate::context::DaemonContext;
use crate::exec::{
    ActionError, CommandAction, CommandExecuter, CommandExecution, DefaultCommandExecuter, Next,
};
use crate::logging::LogRouter;
use crate::services::DaemonServices;
use crate::state::DaemonStateCoordinator;
use crate::warnings::WarningTracker;

use super::environment::FakeEnvironment;
use super::reporter::RecordingHealthReporter;

/// Generous upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Names of the standard stages, outermost first.
pub const ALL_STAGES: [&str; 12] = [
    "close_connection",
    "abort_if_disconnected",
    "catch_failures",
    "handle_stop",
    "start_build",
    "establish_environment",
    "log_to_client",
    "forward_input",
    "return_result",
    "reset_warnings",
    "watch_disconnection",
    "execute_build",
];

/// Shared list of stage names in the order they were entered.
#[derive(Clone, Default)]
pub struct StageLog(Arc<Mutex<Vec<&'static str>>>);

impl StageLog {
    /// Entered stages.
    #[must_use]
    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().expect("stage log poisoned").clone()
    }

    fn push(&self, name: &'static str) {
        self.0.lock().expect("stage log poisoned").push(name);
    }
}

/// Wraps an action so that entering it is recorded.
pub struct RecordingAction {
    inner: Arc<dyn CommandAction>,
    log: StageLog,
}

impl CommandAction for RecordingAction {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        self.log.push(self.inner.name());
        self.inner.execute(execution, next)
    }
}

/// Everything a pipeline test needs, built around one engine.
pub struct PipelineHarness {
    pub reporter: Arc<RecordingHealthReporter>,
    pub environment: Arc<FakeEnvironment>,
    pub services: DaemonServices,
    dispatch: Dispatch,
}

impl PipelineHarness {
    /// Creates idle daemon services around `engine`.
    pub fn new(engine: impl BuildEngine + 'static) -> Self {
        Self::with_environment(engine, Arc::new(daemon_environment()))
    }

    /// Creates idle daemon services around `engine` and `environment`.
    pub fn with_environment(
        engine: impl BuildEngine + 'static,
        environment: Arc<FakeEnvironment>,
    ) -> Self {
        let reporter = Arc::new(RecordingHealthReporter::default());
        let log_router = LogRouter::new(Level::INFO);
        let dispatch = Dispatch::new(Registry::default().with(log_router.layer()));
        let services = DaemonServices {
            context: Arc::new(DaemonContext::new(
                4242,
                SystemTime::UNIX_EPOCH,
                SocketEndpoint::unix("/tmp/kilnd-test.sock"),
                "/tmp",
            )),
            coordinator: Arc::new(DaemonStateCoordinator::new(reporter.clone())),
            engine: Arc::new(engine),
            environment: environment.clone(),
            log_router,
            warnings: Arc::new(WarningTracker::new()),
        };
        Self {
            reporter,
            environment,
            services,
            dispatch,
        }
    }

    /// Runs `body` against the subscriber every harness thread shares.
    pub fn traced<R>(&self, body: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, body)
    }

    /// The daemon-wide state machine.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DaemonStateCoordinator> {
        &self.services.coordinator
    }

    /// An executer over the standard stages that records stage entry.
    #[must_use]
    pub fn recording_executer(&self, log: &StageLog) -> DefaultCommandExecuter {
        let actions = DefaultCommandExecuter::create_actions(&self.services)
            .into_iter()
            .map(|inner| {
                Arc::new(RecordingAction {
                    inner,
                    log: log.clone(),
                }) as Arc<dyn CommandAction>
            })
            .collect();
        DefaultCommandExecuter::with_actions(self.services.clone(), actions)
    }

    /// Runs `command` on this thread under the harness's subscriber. Frames queued with `prepare` are sent first.
    pub fn run(
        &self,
        command: Command,
        prepare: impl FnOnce(&ClientEnd),
    ) -> CompletedCommand {
        let stages = StageLog::default();
        let executer = self.recording_executer(&stages);
        let (connection, client) = ChannelConnection::pair();
        prepare(&client);
        let result = self.traced(|| executer.execute_command(connection, command));
        CompletedCommand {
            client,
            stages,
            result,
        }
    }

    /// Runs `command` on a background thread.
    pub fn spawn(&self, command: Command) -> RunningCommand {
        let stages = StageLog::default();
        let executer = self.recording_executer(&stages);
        let dispatch = self.dispatch.clone();
        let (connection, client) = ChannelConnection::pair();
        let handle = thread::Builder::new()
            .name("pipeline-under-test".to_owned())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    executer.execute_command(connection, command)
                })
            })
            .expect("spawn pipeline thread");
        RunningCommand {
            client,
            stages,
            handle,
        }
    }
}

/// A command whose pipeline has returned.
pub struct CompletedCommand {
    pub client: ClientEnd,
    pub stages: StageLog,
    pub result: Result<(), ActionError>,
}

/// A command whose pipeline runs on another thread.
pub struct RunningCommand {
    pub client: ClientEnd,
    pub stages: StageLog,
    handle: JoinHandle<Result<(), ActionError>>,
}

impl RunningCommand {
    /// Waits for the pipeline to return.
    pub fn join(self) -> CompletedCommand {
        let result = self.handle.join().expect("pipeline thread panicked");
        CompletedCommand {
            client: self.client,
            stages: self.stages,
            result,
        }
    }
}

/// The daemon's own environment before any build touches it.
#[must_use]
pub fn daemon_environment() -> FakeEnvironment {
    FakeEnvironment::new("/daemon", &[("KILN_HOME", "/daemon")])
}

/// A build command running `make all` in `/project`.
#[must_use]
pub fn build_command(id: &str) -> Command {
    Command::build(
        id,
        BuildInvocation::new(["make", "all"]).with_working_directory("/project"),
    )
}

/// Engine succeeding immediately with an empty payload.
#[must_use]
pub fn succeeding_engine() -> MockBuildEngine {
    let mut engine = MockBuildEngine::new();
    engine.expect_run_build().returning(|_| {
        Ok(BuildOutcome::Success {
            payload: serde_json::json!({ "exit_code": 0 }),
        })
    });
    engine
}

/// Engine that must never be called.
#[must_use]
pub fn unused_engine() -> MockBuildEngine {
    let mut engine = MockBuildEngine::new();
    engine.expect_run_build().never();
    engine
}

/// Controls for an engine that blocks until released or cancelled.
pub struct BlockingEngineControl {
    started: Receiver<()>,
    release: Sender<()>,
    observed: Arc<Mutex<Option<CancellationReason>>>,
}

impl BlockingEngineControl {
    /// Waits until the engine has been entered.
    pub fn wait_started(&self) {
        self.started
            .recv_timeout(TEST_TIMEOUT)
            .expect("build engine was not entered");
    }

    /// Lets the blocked build finish successfully.
    pub fn release(&self) {
        drop(self.release.send(()));
    }

    /// Cancellation reason the engine saw, if any.
    #[must_use]
    pub fn observed_cancellation(&self) -> Option<CancellationReason> {
        *self.observed.lock().expect("observed mutex poisoned")
    }
}

/// Engine that blocks inside the build until released or cancelled.
#[must_use]
pub fn blocking_engine() -> (MockBuildEngine, BlockingEngineControl) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);

    let mut engine = MockBuildEngine::new();
    engine.expect_run_build().times(1).returning(move |request| {
        drop(started_tx.lock().expect("started mutex").send(()));
        let release = release_rx.lock().expect("release mutex");
        loop {
            if let Some(reason) = request.cancellation.wait_timeout(Duration::from_millis(10)) {
                *seen.lock().expect("observed mutex") = Some(reason);
                return Err(BuildError::Cancelled { reason });
            }
            if release.try_recv().is_ok() {
                return Ok(BuildOutcome::Success {
                    payload: serde_json::Value::Null,
                });
            }
        }
    });
    (
        engine,
        BlockingEngineControl {
            started: started_rx,
            release: release_tx,
            observed,
        },
    )
}

/// Returns the single result delivered to `client`.
pub fn single_outcome(client: &ClientEnd) -> CommandOutcome {
    let results = client.results();
    assert_eq!(results.len(), 1, "expected exactly one result, got {results:?}");
    results
        .into_iter()
        .next()
        .map(|result| result.outcome)
        .expect("one result")
}
