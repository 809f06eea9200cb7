//! Shared doubles and harnesses for the daemon test suites.

mod config_loader;
mod environment;
mod pipeline;
mod process_world;
mod reporter;

pub use config_loader::{FailingConfigLoader, TestConfigLoader};
pub use environment::FakeEnvironment;
pub use pipeline::{
    ALL_STAGES, BlockingEngineControl, CompletedCommand, PipelineHarness, RunningCommand,
    StageLog, TEST_TIMEOUT, blocking_engine, build_command, daemon_environment, single_outcome,
    succeeding_engine, unused_engine,
};
pub use process_world::{ProcessTestWorld, StepResult, TestShutdownSignal, snapshot_field};
pub use reporter::{HealthEvent, RecordingHealthReporter};
