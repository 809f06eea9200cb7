//! Wire types exchanged between the kiln daemon and its clients.
//!
//! Every message travels as a single JSON object terminated by a newline.
//! A client opens a connection, sends exactly one [`ClientMessage::Command`],
//! may follow it with [`ClientMessage::Input`] frames while a build runs, and
//! reads [`DaemonMessage`] frames until it receives a
//! [`DaemonMessage::Result`] or the daemon closes the connection.
//!
//! ```json
//! {"message":"command","id":"c-1","kind":{"type":"build","arguments":["make","all"]}}
//! {"kind":"log","level":"info","target":"kilnd::build","message":"compiling"}
//! {"kind":"result","id":"c-1","outcome":{"status":"success","payload":null}}
//! ```

mod command;
mod message;
mod state;

pub use command::{BuildInvocation, Command, CommandId, CommandKind};
pub use message::{
    CancellationReason, ClientMessage, CommandOutcome, CommandResult, DaemonMessage,
    FailureDescription, FailureKind, LogRecord,
};
pub use state::DaemonState;
