//! Configuration loaders for scenarios covering success and failure paths.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use tempfile::TempDir;

use kiln_config::{Config, SocketEndpoint};

use crate::bootstrap::ConfigLoader;

/// Loader that provisions a Unix socket path under a temporary directory.
#[derive(Clone)]
pub struct TestConfigLoader {
    socket_dir: Arc<TempDir>,
    client_log_level: String,
}

impl TestConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temporary directory for socket");
        Self {
            socket_dir: Arc::new(dir),
            client_log_level: kiln_config::DEFAULT_CLIENT_LOG_LEVEL.to_owned(),
        }
    }

    /// Overrides the client log level handed to the daemon.
    #[must_use]
    pub fn with_client_log_level(mut self, level: &str) -> Self {
        level.clone_into(&mut self.client_log_level);
        self
    }

    /// Directory holding the socket and runtime files.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.socket_dir.path().to_path_buf()
    }

    /// Path of the daemon socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("kilnd.sock")
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let path = self.socket_path();
        Ok(Config {
            daemon_socket: SocketEndpoint::unix(
                path.to_str()
                    .expect("temporary socket path was not valid UTF-8"),
            ),
            client_log_level: self.client_log_level.clone(),
            ..Config::default()
        })
    }
}

/// Loader that intentionally fails by passing invalid CLI arguments.
#[derive(Debug, Clone, Copy)]
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let args = vec![
            OsString::from("kilnd"),
            OsString::from("--daemon-socket"),
            OsString::from("invalid://socket"),
        ];
        Config::load_from_iter(args)
    }
}
