//! Daemon lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of the daemon-wide state machine.
///
/// `Idle` is initial; `Stopped` and `Broken` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Ready to admit a build.
    #[default]
    Idle,
    /// A build is running.
    Busy,
    /// A stop was requested; waiting for the active build to wind down.
    Stopping,
    /// Stopped; no further commands are admitted.
    Stopped,
    /// The state machine detected an internal inconsistency.
    Broken,
}

impl DaemonState {
    /// Returns `true` for states that never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Broken)
    }

    /// Lower-case name used in logs and health snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Broken => "broken",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
