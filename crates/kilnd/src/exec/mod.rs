//! The command pipeline.
//!
//! Every command received by the daemon runs through the same ordered list
//! of [`CommandAction`]s. Each action receives the per-command
//! [`CommandExecution`] and a [`Next`] continuation; work done before
//! calling [`Next::proceed`] happens on the way in, work after it on the way
//! out. An action that does not proceed ends the chain.

mod action;
pub mod actions;
mod errors;
mod executer;
mod execution;
mod handler;

pub use self::action::{CommandAction, Next};
pub use self::errors::ActionError;
pub use self::executer::{CommandExecuter, DefaultCommandExecuter};
pub use self::execution::{CommandExecution, Delivery};
pub use self::handler::{DaemonConnectionHandler, UNIDENTIFIED_COMMAND};

const EXEC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::exec");
