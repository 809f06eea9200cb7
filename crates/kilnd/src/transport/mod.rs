//! Socket listener for daemon transport endpoints.
//!
//! The listener binds the configured endpoint, accepts connections on a
//! background thread, and hands each accepted stream to a
//! [`ConnectionHandler`] running on its own thread.

mod errors;
mod handler;
mod listener;
#[cfg(test)]
mod test_utils;

pub use self::errors::ListenerError;
pub use self::handler::{ConnectionHandler, ConnectionStream};
pub use self::listener::{ListenerHandle, SocketListener};
#[cfg(test)]
pub(crate) use self::test_utils::{FAREWELL, RecordingHandler};

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
