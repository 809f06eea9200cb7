//! In-memory connection double for pipeline and decorator tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use kiln_daemon_types::{ClientMessage, CommandResult, DaemonMessage, LogRecord};

use super::{Connection, ConnectionError};

enum Frame {
    Message(ClientMessage),
    EndOfStream,
}

/// Something that happened on the daemon side of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireEvent {
    Sent(DaemonMessage),
    Closed,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<WireEvent>>,
    closes: AtomicUsize,
    peer_gone: AtomicBool,
}

/// Daemon side of an in-memory connection.
pub(crate) struct ChannelConnection {
    inbound: Mutex<Receiver<Frame>>,
    wake: Sender<Frame>,
    shared: Arc<Shared>,
}

/// Client side of an in-memory connection.
#[derive(Clone)]
pub(crate) struct ClientEnd {
    outbound: Sender<Frame>,
    shared: Arc<Shared>,
}

impl ChannelConnection {
    pub(crate) fn pair() -> (Arc<Self>, ClientEnd) {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        let connection = Arc::new(Self {
            inbound: Mutex::new(receiver),
            wake: sender.clone(),
            shared: Arc::clone(&shared),
        });
        (
            connection,
            ClientEnd {
                outbound: sender,
                shared,
            },
        )
    }
}

impl Connection for ChannelConnection {
    fn dispatch(&self, message: &DaemonMessage) -> Result<(), ConnectionError> {
        if self.shared.peer_gone.load(Ordering::SeqCst) {
            return Err(ConnectionError::Io {
                source: io::Error::from(io::ErrorKind::BrokenPipe),
            });
        }
        if self.shared.closes.load(Ordering::SeqCst) > 0 {
            return Err(ConnectionError::Closed);
        }
        self.shared
            .events
            .lock()
            .expect("events mutex poisoned")
            .push(WireEvent::Sent(message.clone()));
        Ok(())
    }

    fn receive(&self) -> Result<Option<ClientMessage>, ConnectionError> {
        let frame = self
            .inbound
            .lock()
            .expect("inbound mutex poisoned")
            .recv();
        match frame {
            Ok(Frame::Message(message)) => Ok(Some(message)),
            Ok(Frame::EndOfStream) | Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        if self.shared.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.shared
                .events
                .lock()
                .expect("events mutex poisoned")
                .push(WireEvent::Closed);
        }
        let _ = self.wake.send(Frame::EndOfStream);
    }
}

impl ClientEnd {
    pub(crate) fn send(&self, message: ClientMessage) {
        self.outbound
            .send(Frame::Message(message))
            .expect("connection dropped");
    }

    pub(crate) fn disconnect(&self) {
        self.shared.peer_gone.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Frame::EndOfStream);
    }

    pub(crate) fn events(&self) -> Vec<WireEvent> {
        self.shared
            .events
            .lock()
            .expect("events mutex poisoned")
            .clone()
    }

    pub(crate) fn results(&self) -> Vec<CommandResult> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WireEvent::Sent(DaemonMessage::Result(result)) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn logs(&self) -> Vec<LogRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WireEvent::Sent(DaemonMessage::Log(record)) => Some(record),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}
