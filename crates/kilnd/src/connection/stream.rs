//! JSON lines framing over an accepted socket.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_daemon_types::{ClientMessage, DaemonMessage};
use tracing::debug;

use super::{CONNECTION_TARGET, Connection, ConnectionError};
use crate::transport::ConnectionStream;

/// Largest client frame accepted, newline included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// [`Connection`] that exchanges one JSON object per line.
///
/// Reads and writes use separate handles onto the same socket so a reader
/// blocked in [`receive`](Connection::receive) never delays a dispatch.
pub struct StreamConnection {
    reader: Mutex<BufReader<ConnectionStream>>,
    writer: Mutex<ConnectionStream>,
    control: ConnectionStream,
    closed: AtomicBool,
}

impl StreamConnection {
    /// Wraps an accepted stream.
    pub fn new(stream: ConnectionStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
        })
    }

    fn read_frame(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let mut reader = lock(&self.reader);
        loop {
            let mut frame = Vec::new();
            let limit = u64::try_from(MAX_FRAME_BYTES).unwrap_or(u64::MAX);
            let read = (&mut *reader)
                .take(limit.saturating_add(1))
                .read_until(b'\n', &mut frame)?;
            if read == 0 {
                return Ok(None);
            }
            if frame.len() > MAX_FRAME_BYTES {
                return Err(ConnectionError::FrameTooLarge {
                    limit: MAX_FRAME_BYTES,
                });
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

impl Connection for StreamConnection {
    fn dispatch(&self, message: &DaemonMessage) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let mut line =
            serde_json::to_vec(message).map_err(|source| ConnectionError::Encode { source })?;
        line.push(b'\n');
        let mut writer = lock(&self.writer);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    fn receive(&self) -> Result<Option<ClientMessage>, ConnectionError> {
        let Some(frame) = self.read_frame()? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|source| ConnectionError::Decode { source })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.control.shutdown(Shutdown::Both)
            && error.kind() != io::ErrorKind::NotConnected
        {
            debug!(
                target: CONNECTION_TARGET,
                error = %error,
                "failed to shut down connection"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
