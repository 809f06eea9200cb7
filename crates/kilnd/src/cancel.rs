//! Cooperative cancellation shared between the pipeline and its watchers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kiln_daemon_types::CancellationReason;

/// Clonable flag raised when a running build should wind down.
///
/// All clones observe the same flag. The first reason recorded wins; later
/// cancellations are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    reason: Mutex<Option<CancellationReason>>,
    raised: Condvar,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call raised the flag.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.inner.raised.notify_all();
        true
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().is_some()
    }

    /// Reason recorded by the first cancellation, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancellationReason> {
        *self.lock()
    }

    /// Blocks for up to `timeout` waiting for cancellation.
    ///
    /// Returns the reason when the token is (or becomes) cancelled within the
    /// timeout, and `None` otherwise.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancellationReason> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(reason) = *slot {
                return Some(reason);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .inner
                .raised
                .wait_timeout(slot, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    // The slot holds a plain `Option`, so a poisoned lock carries no broken
    // invariant and can be reused.
    fn lock(&self) -> MutexGuard<'_, Option<CancellationReason>> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
