//! Message-framed connections between the daemon and one client.
//!
//! [`StreamConnection`] frames [`ClientMessage`] and [`DaemonMessage`] values
//! as JSON lines over an accepted socket. [`DisconnectAwareConnection`] wraps
//! any [`Connection`] with a background listener that notices when the peer
//! goes away.

mod disconnect;
mod errors;
mod stream;
#[cfg(test)]
pub(crate) mod test_support;

use kiln_daemon_types::{ClientMessage, DaemonMessage};

pub use self::disconnect::{DisconnectAwareConnection, DisconnectCallback, Inbound};
pub use self::errors::ConnectionError;
pub use self::stream::{MAX_FRAME_BYTES, StreamConnection};

const CONNECTION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connection");

/// Bidirectional, ordered channel to a single client.
pub trait Connection: Send + Sync {
    /// Sends one message to the client.
    fn dispatch(&self, message: &DaemonMessage) -> Result<(), ConnectionError>;

    /// Blocks for the next client message. `Ok(None)` signals end of stream.
    fn receive(&self) -> Result<Option<ClientMessage>, ConnectionError>;

    /// Closes the channel in both directions. Repeated calls have no effect.
    fn close(&self);
}
