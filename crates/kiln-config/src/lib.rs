//! Shared configuration for the kiln build daemon.
//!
//! Values are layered by [`ortho_config`]: built-in defaults, then
//! `kiln.toml` files, then `KILN_*` environment variables, and finally
//! command-line flags. The daemon and any client read the same structure so
//! both sides agree on where the socket lives.

mod defaults;
mod logging;
mod runtime;
mod socket;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CLIENT_LOG_LEVEL, DEFAULT_LOG_FILTER, DEFAULT_TCP_PORT, default_client_log_level,
    default_log_filter, default_log_format, default_socket_endpoint,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "KILN")]
pub struct Config {
    /// Endpoint the daemon listens on.
    #[ortho_config(default = default_socket_endpoint())]
    pub daemon_socket: SocketEndpoint,
    /// `tracing` filter expression for the daemon's own log output.
    #[ortho_config(default = default_log_filter().to_owned())]
    pub log_filter: String,
    /// Output format for the daemon's own log output.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Minimum level of build log events streamed back to clients.
    #[ortho_config(default = default_client_log_level().to_owned())]
    pub client_log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_socket: default_socket_endpoint(),
            log_filter: default_log_filter().to_owned(),
            log_format: default_log_format(),
            client_log_level: default_client_log_level().to_owned(),
        }
    }
}

impl Config {
    /// Endpoint the daemon listens on.
    #[must_use]
    pub fn daemon_socket(&self) -> &SocketEndpoint {
        &self.daemon_socket
    }

    /// Filter expression for daemon logs.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Format for daemon logs.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Minimum level forwarded to clients while a build runs.
    #[must_use]
    pub fn client_log_level(&self) -> &str {
        &self.client_log_level
    }
}
