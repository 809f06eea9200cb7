//! Connection decorator that watches for the client going away.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kiln_daemon_types::{ClientMessage, DaemonMessage};
use tracing::{debug, warn};

use super::{CONNECTION_TARGET, Connection, ConnectionError};

/// Callback invoked once when the peer disconnects.
pub type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// What a timed receive on the decorator produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The client sent a message.
    Message(ClientMessage),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The client is gone and no buffered messages remain.
    Disconnected,
}

#[derive(Default)]
struct Watch {
    disconnected: AtomicBool,
    closing: AtomicBool,
    callback: Mutex<Option<DisconnectCallback>>,
}

/// Wraps a [`Connection`] with a background listener detecting disconnects.
///
/// The listener thread is the only reader of the wrapped connection. Frames
/// it receives are buffered for [`receive_timeout`](Self::receive_timeout);
/// end of stream or a transport error marks the connection disconnected and
/// runs the registered callback exactly once. Closing the decorator locally
/// is not a disconnect.
///
/// A client that shuts down only its write half is indistinguishable from
/// one that went away, so it too is treated as disconnected and its build is
/// cancelled. Clients end their input with `ClientMessage::CloseInput` and
/// keep the socket fully open until the result arrives.
pub struct DisconnectAwareConnection {
    inner: Arc<dyn Connection>,
    watch: Arc<Watch>,
    inbound: Mutex<Receiver<ClientMessage>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DisconnectAwareConnection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DisconnectAwareConnection")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

impl DisconnectAwareConnection {
    /// Wraps `inner` and starts the listener thread.
    pub fn new(inner: Arc<dyn Connection>) -> io::Result<Self> {
        let watch = Arc::new(Watch::default());
        let (sender, receiver) = mpsc::channel();
        let listener = thread::Builder::new()
            .name("kilnd-disconnect-watch".to_owned())
            .spawn({
                let inner = Arc::clone(&inner);
                let watch = Arc::clone(&watch);
                move || listen(inner.as_ref(), &watch, &sender)
            })?;
        Ok(Self {
            inner,
            watch,
            inbound: Mutex::new(receiver),
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Registers (or with `None`, clears) the disconnect callback.
    ///
    /// If the client has already disconnected the callback runs immediately
    /// on the calling thread.
    pub fn on_disconnect(&self, callback: Option<DisconnectCallback>) {
        let mut slot = lock(&self.watch.callback);
        match callback {
            Some(callback) if self.watch.disconnected.load(Ordering::SeqCst) => {
                drop(slot);
                callback();
            }
            callback => *slot = callback,
        }
    }

    /// Returns `true` once the listener saw the client go away.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.watch.disconnected.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the next buffered client message.
    pub fn receive_timeout(&self, timeout: Duration) -> Inbound {
        match lock(&self.inbound).recv_timeout(timeout) {
            Ok(message) => Inbound::Message(message),
            Err(RecvTimeoutError::Timeout) => Inbound::Timeout,
            Err(RecvTimeoutError::Disconnected) => Inbound::Disconnected,
        }
    }

    fn join_listener(&self) {
        let Some(handle) = lock(&self.listener).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(target: CONNECTION_TARGET, "disconnect listener panicked");
        }
    }
}

impl Connection for DisconnectAwareConnection {
    fn dispatch(&self, message: &DaemonMessage) -> Result<(), ConnectionError> {
        if self.is_disconnected() {
            return Err(ConnectionError::Disconnected);
        }
        match self.inner.dispatch(message) {
            Err(error) if error.is_disconnect() => {
                debug!(
                    target: CONNECTION_TARGET,
                    error = %error,
                    "dispatch failed; treating client as disconnected"
                );
                Err(ConnectionError::Disconnected)
            }
            other => other,
        }
    }

    fn receive(&self) -> Result<Option<ClientMessage>, ConnectionError> {
        Ok(lock(&self.inbound).recv().ok())
    }

    fn close(&self) {
        if self.watch.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.close();
        self.join_listener();
    }
}

impl Drop for DisconnectAwareConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen(inner: &dyn Connection, watch: &Watch, sender: &Sender<ClientMessage>) {
    loop {
        match inner.receive() {
            Ok(Some(message)) => {
                if sender.send(message).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(ConnectionError::Decode { source }) => {
                warn!(
                    target: CONNECTION_TARGET,
                    error = %source,
                    "ignoring malformed client frame"
                );
            }
            Err(error) => {
                if !watch.closing.load(Ordering::SeqCst) {
                    debug!(
                        target: CONNECTION_TARGET,
                        error = %error,
                        "client connection failed"
                    );
                }
                break;
            }
        }
    }

    if watch.closing.load(Ordering::SeqCst) {
        return;
    }
    let callback = {
        let mut slot = lock(&watch.callback);
        watch.disconnected.store(true, Ordering::SeqCst);
        slot.take()
    };
    debug!(target: CONNECTION_TARGET, "client disconnected");
    if let Some(callback) = callback {
        callback();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
