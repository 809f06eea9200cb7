//! Process supervision test world shared across BDD scenarios.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use serde_json::Value;
use signal_hook::consts::signal::SIGTERM;

use kiln_config::RuntimePaths;
use kiln_daemon_types::{ClientMessage, Command, CommandOutcome, DaemonMessage};

use crate::bootstrap::BuildCollaborators;
use crate::process::daemonizer::{DaemonizeError, Daemonizer};
use crate::process::launch::{LaunchPlan, ProcessControl, ServiceDeps, run_daemon_with};
use crate::process::shutdown::{ShutdownError, ShutdownSignal};
use crate::process::{LaunchError, LaunchMode};

use super::config_loader::{FailingConfigLoader, TestConfigLoader};
use super::environment::FakeEnvironment;
use super::pipeline::{TEST_TIMEOUT, succeeding_engine};
use super::reporter::RecordingHealthReporter;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(25);

pub type StepResult = Result<(), String>;

pub struct ProcessTestWorld {
    loader: TestConfigLoader,
    reporter: Arc<RecordingHealthReporter>,
    daemonizer: TestDaemonizer,
    shutdown: TestShutdownSignal,
    handle: Option<thread::JoinHandle<Result<(), LaunchError>>>,
    result: Option<Result<(), LaunchError>>,
    stop_outcome: Option<CommandOutcome>,
}

impl Default for ProcessTestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTestWorld {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loader: TestConfigLoader::new(),
            reporter: Arc::new(RecordingHealthReporter::default()),
            daemonizer: TestDaemonizer::default(),
            shutdown: TestShutdownSignal::new(),
            handle: None,
            result: None,
            stop_outcome: None,
        }
    }

    fn collaborators() -> BuildCollaborators {
        BuildCollaborators {
            engine: Arc::new(succeeding_engine()),
            environment: Arc::new(FakeEnvironment::new("/daemon", &[])),
        }
    }

    pub fn start_background(&mut self) -> StepResult {
        if self.handle.is_some() {
            return Err("daemon already running".to_owned());
        }
        let loader = self.loader.clone();
        let reporter = self.reporter.clone() as Arc<dyn crate::health::HealthReporter>;
        let daemonizer = self.daemonizer.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(thread::spawn(move || {
            run_daemon_with(LaunchPlan {
                process: ProcessControl {
                    mode: LaunchMode::Background,
                    daemonizer,
                    shutdown,
                },
                services: ServiceDeps {
                    loader,
                    reporter,
                    builds: Self::collaborators(),
                },
            })
        }));
        Ok(())
    }

    pub fn start_foreground(&mut self, pretrigger: bool) -> StepResult {
        if self.result.is_some() {
            return Err("result already recorded".to_owned());
        }
        let shutdown = TestShutdownSignal::new();
        if pretrigger {
            shutdown.trigger();
        }
        let result = run_daemon_with(LaunchPlan {
            process: ProcessControl {
                mode: LaunchMode::Foreground,
                daemonizer: self.daemonizer.clone(),
                shutdown,
            },
            services: ServiceDeps {
                loader: self.loader.clone(),
                reporter: self.reporter.clone(),
                builds: Self::collaborators(),
            },
        });
        self.result = Some(result);
        Ok(())
    }

    pub fn start_foreground_with_invalid_config(&mut self) -> StepResult {
        if self.result.is_some() {
            return Err("result already recorded".to_owned());
        }
        let result = run_daemon_with(LaunchPlan {
            process: ProcessControl {
                mode: LaunchMode::Foreground,
                daemonizer: self.daemonizer.clone(),
                shutdown: TestShutdownSignal::new(),
            },
            services: ServiceDeps {
                loader: FailingConfigLoader,
                reporter: self.reporter.clone(),
                builds: Self::collaborators(),
            },
        });
        self.result = Some(result);
        Ok(())
    }

    pub fn join_background(&mut self) -> StepResult {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| "daemon not running".to_owned())?;
        let deadline = Instant::now() + TEST_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err("daemon did not stop in time".to_owned());
            }
            thread::sleep(POLL_INTERVAL);
        }
        match handle.join() {
            Ok(result) => {
                self.result = Some(result);
                Ok(())
            }
            Err(_) => Err("daemon thread panicked".to_owned()),
        }
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Sends a stop command over the daemon socket and records the reply.
    pub fn send_stop(&mut self) -> StepResult {
        let stream = std::os::unix::net::UnixStream::connect(self.loader.socket_path())
            .map_err(|error| error.to_string())?;
        stream
            .set_read_timeout(Some(TEST_TIMEOUT))
            .map_err(|error| error.to_string())?;
        let mut writer = stream.try_clone().map_err(|error| error.to_string())?;
        let frame = serde_json::to_string(&ClientMessage::Command(Command::stop("stop-1")))
            .map_err(|error| error.to_string())?;
        writeln!(writer, "{frame}").map_err(|error| error.to_string())?;

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .map_err(|error| error.to_string())?;
        match serde_json::from_str(&line).map_err(|error| error.to_string())? {
            DaemonMessage::Result(result) => {
                self.stop_outcome = Some(result.outcome);
                Ok(())
            }
            other => Err(format!("expected a result, got {other:?}")),
        }
    }

    #[must_use]
    pub fn stop_outcome(&self) -> Option<&CommandOutcome> {
        self.stop_outcome.as_ref()
    }

    #[must_use]
    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::in_directory(self.loader.runtime_dir())
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.paths().lock_path().to_path_buf()
    }

    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.paths().pid_path().to_path_buf()
    }

    #[must_use]
    pub fn health_path(&self) -> PathBuf {
        self.paths().health_path().to_path_buf()
    }

    pub fn read_health(&self) -> Result<Value, String> {
        let content = fs::read_to_string(self.health_path()).map_err(|error| error.to_string())?;
        serde_json::from_str(&content).map_err(|error| error.to_string())
    }

    pub fn wait_for_status(&self, expected: &str) -> StepResult {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while Instant::now() < deadline {
            if self
                .read_health()
                .is_ok_and(|snapshot| snapshot_field(&snapshot, "status") == expected)
            {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(format!("daemon did not publish {expected} health snapshot"))
    }

    pub fn write_stale_runtime(&self) -> StepResult {
        fs::write(self.lock_path(), b"").map_err(|error| error.to_string())?;
        fs::write(self.pid_path(), b"0\n").map_err(|error| error.to_string())?;
        Ok(())
    }

    #[must_use]
    pub fn daemonizer_calls(&self) -> usize {
        self.daemonizer.calls()
    }

    #[must_use]
    pub fn reporter(&self) -> &RecordingHealthReporter {
        &self.reporter
    }

    #[must_use]
    pub fn last_result(&self) -> Option<&Result<(), LaunchError>> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&LaunchError> {
        self.result.as_ref()?.as_ref().err()
    }
}

/// Reads a string field from a health snapshot.
pub fn snapshot_field<'a>(snapshot: &'a Value, field: &str) -> &'a str {
    snapshot
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[derive(Clone, Default)]
pub struct TestDaemonizer {
    calls: Arc<AtomicUsize>,
}

impl TestDaemonizer {
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Daemonizer for TestDaemonizer {
    fn daemonize(&self, _paths: &RuntimePaths) -> Result<(), DaemonizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Shutdown signal fired explicitly by the test.
#[derive(Clone)]
pub struct TestShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TestShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().expect("shutdown mutex poisoned");
        *triggered = true;
        cvar.notify_all();
    }
}

impl ShutdownSignal for TestShutdownSignal {
    fn wait(&self) -> Result<i32, ShutdownError> {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().expect("shutdown mutex poisoned");
        while !*triggered {
            triggered = cvar
                .wait(triggered)
                .expect("shutdown mutex poisoned during wait");
        }
        Ok(SIGTERM)
    }
}
