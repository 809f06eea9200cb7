//! Listener implementation for daemon transport sockets.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use kiln_config::SocketEndpoint;

use super::{ConnectionHandler, ConnectionStream, LISTENER_TARGET, ListenerError};

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::Path;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);
/// Longest [`ListenerHandle::join`] waits for connection threads to finish.
pub const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener bound to the daemon's socket endpoint.
#[derive(Debug)]
pub struct SocketListener {
    endpoint: SocketEndpoint,
    listener: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl SocketListener {
    /// Binds `endpoint`, replacing a stale Unix socket when one is found.
    pub fn bind(endpoint: &SocketEndpoint) -> Result<Self, ListenerError> {
        match endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let listener = bind_tcp(host, *port)?;
                Ok(Self {
                    endpoint: endpoint.clone(),
                    listener: ListenerKind::Tcp(listener),
                })
            }
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    let listener = bind_unix(path.as_std_path())?;
                    Ok(Self {
                        endpoint: endpoint.clone(),
                        listener: ListenerKind::Unix(listener),
                    })
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(ListenerError::UnsupportedUnix {
                        endpoint: endpoint.to_string(),
                    })
                }
            }
        }
    }

    /// Address of a TCP listener; `None` for Unix sockets.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    /// Starts accepting connections on a background thread.
    pub fn start(
        self,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<ListenerHandle, ListenerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        if let Err(error) = match &self.listener {
            ListenerKind::Tcp(listener) => listener.set_nonblocking(true),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener.set_nonblocking(true),
        } {
            #[cfg(unix)]
            cleanup_unix_socket(&self.endpoint);
            return Err(ListenerError::NonBlocking { source: error });
        }
        let shutdown_flag = Arc::clone(&shutdown);
        let connections = Arc::new(InFlight::default());
        let tracked = Arc::clone(&connections);
        let handle = thread::Builder::new()
            .name("kilnd-accept".to_owned())
            .spawn(move || run_accept_loop(&self, &shutdown_flag, &handler, &tracked))
            .map_err(|source| ListenerError::Spawn { source })?;
        Ok(ListenerHandle {
            shutdown,
            handle: Some(handle),
            connections,
        })
    }
}

/// Handle to the background accept thread and the connections it started.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    connections: Arc<InFlight>,
}

impl ListenerHandle {
    /// Asks the accept loop to stop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Number of connection threads still running.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    /// Waits for the accept loop to finish, then gives running connections
    /// up to [`CONNECTION_DRAIN_TIMEOUT`] to deliver their last frames.
    pub fn join(self) -> Result<(), ListenerError> {
        self.join_within(CONNECTION_DRAIN_TIMEOUT)
    }

    /// As [`ListenerHandle::join`], with an explicit drain timeout.
    pub fn join_within(mut self, drain: Duration) -> Result<(), ListenerError> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| ListenerError::ThreadPanic)?;
        }
        let remaining = self.connections.wait_drained(drain);
        if remaining > 0 {
            warn!(
                target: LISTENER_TARGET,
                remaining,
                "connections still open after the drain timeout; abandoning them"
            );
        }
        Ok(())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Counts connection threads that have not returned yet.
#[derive(Debug, Default)]
struct InFlight {
    active: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightConnection {
        *self.lock() += 1;
        InFlightConnection {
            tracker: Arc::clone(self),
        }
    }

    fn active(&self) -> usize {
        *self.lock()
    }

    fn wait_drained(&self, timeout: Duration) -> usize {
        let active = self.lock();
        let (active, _) = self
            .drained
            .wait_timeout_while(active, timeout, |active| *active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InFlightConnection {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightConnection {
    fn drop(&mut self) {
        let mut active = self.tracker.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.tracker.drained.notify_all();
        }
    }
}

fn run_accept_loop(
    listener: &SocketListener,
    shutdown: &AtomicBool,
    handler: &Arc<dyn ConnectionHandler>,
    connections: &Arc<InFlight>,
) {
    info!(
        target: LISTENER_TARGET,
        endpoint = %listener.endpoint,
        "socket listener active"
    );
    let mut accepted: u64 = 0;
    let mut last_error = None::<io::ErrorKind>;
    while !shutdown.load(Ordering::SeqCst) {
        match accept_connection(listener) {
            Ok(Some(stream)) => {
                last_error = None;
                spawn_connection(accepted, stream, Arc::clone(handler), connections.enter());
                accepted = accepted.wrapping_add(1);
            }
            Ok(None) => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) => {
                let kind = error.kind();
                if last_error != Some(kind) {
                    warn!(
                        target: LISTENER_TARGET,
                        error = %error,
                        "socket accept error"
                    );
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    #[cfg(unix)]
    cleanup_unix_socket(&listener.endpoint);
    info!(target: LISTENER_TARGET, "socket listener stopped");
}

fn spawn_connection(
    sequence: u64,
    stream: ConnectionStream,
    handler: Arc<dyn ConnectionHandler>,
    tracked: InFlightConnection,
) {
    debug!(target: LISTENER_TARGET, connection = sequence, "connection accepted");
    let spawned = thread::Builder::new()
        .name(format!("kilnd-connection-{sequence}"))
        .spawn(move || {
            let _tracked = tracked;
            handler.handle(stream);
        });
    if let Err(error) = spawned {
        warn!(
            target: LISTENER_TARGET,
            connection = sequence,
            error = %error,
            "failed to spawn connection thread; dropping connection"
        );
    }
}

fn accept_connection(listener: &SocketListener) -> Result<Option<ConnectionStream>, io::Error> {
    match &listener.listener {
        ListenerKind::Tcp(tcp) => match tcp.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(ConnectionStream::Tcp(stream)))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        },
        #[cfg(unix)]
        ListenerKind::Unix(unix) => match unix.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(ConnectionStream::Unix(stream)))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        },
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    let addr = addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })?;
    TcpListener::bind(addr).map_err(|source| ListenerError::BindTcp { addr, source })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        replace_stale_socket(path)?;
    }
    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(unix)]
fn replace_stale_socket(path: &Path) -> Result<(), ListenerError> {
    let path_text = || path.display().to_string();
    let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::UnixMetadata {
        path: path_text(),
        source,
    })?;
    if !metadata.file_type().is_socket() {
        return Err(ListenerError::UnixNotSocket { path: path_text() });
    }
    match UnixStream::connect(path) {
        Ok(_stream) => Err(ListenerError::UnixInUse { path: path_text() }),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            debug!(target: LISTENER_TARGET, path = %path.display(), "removing stale unix socket");
            fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                path: path_text(),
                source,
            })
        }
        Err(source) => Err(ListenerError::UnixConnect {
            path: path_text(),
            source,
        }),
    }
}

#[cfg(unix)]
fn cleanup_unix_socket(endpoint: &SocketEndpoint) {
    let SocketEndpoint::Unix { path } = endpoint else {
        return;
    };
    if let Err(error) = fs::remove_file(path.as_std_path())
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}
