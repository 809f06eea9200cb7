//! Error types for connection operations.

use std::io;

use thiserror::Error;

/// Errors surfaced while exchanging frames with a client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The client went away; nothing further can be delivered.
    #[error("client disconnected")]
    Disconnected,
    /// The daemon already closed this connection.
    #[error("connection already closed")]
    Closed,
    /// Reading from or writing to the socket failed.
    #[error("connection I/O failed: {source}")]
    Io {
        /// Underlying IO error.
        #[from]
        source: io::Error,
    },
    /// A daemon message could not be serialised.
    #[error("failed to encode daemon message: {source}")]
    Encode {
        /// Underlying serialisation error.
        #[source]
        source: serde_json::Error,
    },
    /// A client frame was not a valid message.
    #[error("failed to decode client frame: {source}")]
    Decode {
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },
    /// A client frame exceeded the size limit.
    #[error("client frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Maximum accepted frame size in bytes.
        limit: usize,
    },
}

impl ConnectionError {
    /// Returns `true` when the error means the peer is gone.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Io { source } => matches!(
                source.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
