#[cfg(unix)]
use camino::Utf8PathBuf;
#[cfg(unix)]
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

use crate::socket::SocketEndpoint;

/// TCP port used when Unix domain sockets are not available.
pub const DEFAULT_TCP_PORT: u16 = 9877;

/// Filter expression applied to the daemon's own logs.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Lowest level of build log output streamed to clients.
pub const DEFAULT_CLIENT_LOG_LEVEL: &str = "info";

/// Filter expression applied to the daemon's own logs.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Lowest level of build log output streamed to clients.
pub fn default_client_log_level() -> &'static str {
    DEFAULT_CLIENT_LOG_LEVEL
}

/// Default logging format for the daemon.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Computes the default socket endpoint for the daemon.
pub fn default_socket_endpoint() -> SocketEndpoint {
    default_socket_endpoint_inner()
}

#[cfg(unix)]
fn default_socket_endpoint_inner() -> SocketEndpoint {
    let mut base = match runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok()) {
        Some(dir) => dir.join("kiln"),
        None => {
            let temp = Utf8PathBuf::from_path_buf(env::temp_dir())
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
            // Shared temp directories need a per-user namespace.
            let uid = unsafe { geteuid() };
            temp.join("kiln").join(format!("uid-{uid}"))
        }
    };
    base.push("kilnd.sock");
    SocketEndpoint::unix(base)
}

#[cfg(not(unix))]
fn default_socket_endpoint_inner() -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", DEFAULT_TCP_PORT)
}
