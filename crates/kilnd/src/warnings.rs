//! One-time warnings scoped to a single build.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

const WARNINGS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::warnings");

/// Emits each distinct warning at most once until [`reset`](Self::reset).
///
/// The daemon keeps one tracker for its whole lifetime and clears it before
/// every build so warnings surface again for the next client.
#[derive(Debug, Default)]
pub struct WarningTracker {
    seen: Mutex<HashSet<String>>,
}

impl WarningTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `message` unless it was already logged since the last reset.
    ///
    /// Returns `true` if the warning was emitted.
    pub fn warn_once(&self, message: &str) -> bool {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.to_owned());
        if first {
            warn!(target: WARNINGS_TARGET, "{message}");
        }
        first
    }

    /// Forgets every emitted warning.
    pub fn reset(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of distinct warnings emitted since the last reset.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
