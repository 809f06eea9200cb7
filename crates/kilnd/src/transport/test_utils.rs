//! Test helpers for the transport module.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{ConnectionHandler, ConnectionStream};

/// Line every [`RecordingHandler`] writes before returning.
pub(crate) const FAREWELL: &[u8] = b"{\"farewell\":true}\n";

/// Handler that records connections and answers each with [`FAREWELL`]
/// after an optional delay.
pub(crate) struct RecordingHandler {
    accepted: AtomicUsize,
    finished: AtomicUsize,
    linger: Duration,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Self::lingering(Duration::ZERO)
    }

    /// Handler that waits `linger` before answering.
    pub(crate) fn lingering(linger: Duration) -> Arc<Self> {
        Arc::new(Self {
            accepted: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            linger,
        })
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Polls until `expected` connections were accepted or two seconds pass.
    pub(crate) fn wait_for_accepted(&self, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.accepted.load(Ordering::SeqCst) >= expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl ConnectionHandler for RecordingHandler {
    fn handle(&self, mut stream: ConnectionStream) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.linger);
        let _ = stream.write_all(FAREWELL).and_then(|()| stream.flush());
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}
