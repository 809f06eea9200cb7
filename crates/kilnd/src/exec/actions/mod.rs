//! The twelve stages of the command pipeline, outermost first.

mod admission;
mod build;
mod connection;
mod environment;
mod failure;
mod input;
mod logging;
mod result;

pub use self::admission::{HandleStop, StartBuildOrRespondWithBusy};
pub use self::build::{ExecuteBuild, WatchForDisconnection};
pub use self::connection::{AbortIfClientDisconnected, CloseConnectionAfterExecution};
pub use self::environment::EstablishBuildEnvironment;
pub use self::failure::CatchAndForwardFailure;
pub use self::input::ForwardClientInput;
pub use self::logging::LogToClient;
pub use self::result::{ResetWarnings, ReturnResult};
