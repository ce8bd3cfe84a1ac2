//! Server lifecycle: bind, serve in the background, drain on shutdown.
//!
//! ```text
//! NotStarted -> Serving -> ShuttingDown -> Stopped
//! ```
//!
//! `Stopped` is reached both by a clean drain and by a drain that ran out
//! of time. Only the returned error tells them apart.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Server as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::key_manager::KeyManager;
use crate::middleware::Chain;
use crate::ssh_server::SshServer;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Serving,
    ShuttingDown,
    Stopped,
}

/// Counts in-flight connections so shutdown can wait for them.
#[derive(Clone)]
struct SessionTracker {
    active: Arc<watch::Sender<usize>>,
}

/// Decrements the active count when the connection task ends.
struct SessionGuard {
    active: Arc<watch::Sender<usize>>,
}

impl SessionTracker {
    fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }

    fn track(&self) -> SessionGuard {
        self.active.send_modify(|n| *n += 1);
        SessionGuard {
            active: self.active.clone(),
        }
    }

    fn active(&self) -> usize {
        *self.active.borrow()
    }

    async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // sender 由 self 持有，wait_for 不会因通道关闭而失败
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n -= 1);
    }
}

/// Server Lifecycle Controller
pub struct Server {
    config: ServerConfig,
    chain: Chain,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Server {
    pub fn new(config: ServerConfig, chain: Chain) -> Self {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            config,
            chain,
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Load the host key, bind the listener and start accepting in the
    /// background. Returns as soon as the listener is bound.
    ///
    /// On failure the error is logged and the state stays `NotStarted`.
    pub async fn start(&self) -> Result<ServerHandle, ServerError> {
        let result = self.try_start().await;
        if let Err(e) = &result {
            error!(error = %e, "could not start server");
        }
        result
    }

    async fn try_start(&self) -> Result<ServerHandle, ServerError> {
        if self.state() != LifecycleState::NotStarted {
            return Err(ServerError::AlreadyStarted);
        }

        let key_manager = KeyManager::new(&self.config.host_key_path);
        let host_key = key_manager
            .load_or_generate()
            .map_err(|source| ServerError::HostKey {
                path: self.config.host_key_path.clone(),
                source,
            })?;

        let ssh_config = russh::server::Config {
            inactivity_timeout: self.config.idle_timeout,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };

        let addr = self.config.addr();
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let sessions = SessionTracker::new();
        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(ssh_config),
            SshServer::new(self.chain.clone()),
            sessions.clone(),
            stop_rx,
        ));

        self.state.send_replace(LifecycleState::Serving);
        info!(
            host = %self.config.host,
            port = self.config.port,
            local_addr = %local_addr,
            "Starting SSH server"
        );

        Ok(ServerHandle {
            local_addr,
            stop: Some(stop_tx),
            accept_task: Some(accept_task),
            sessions,
            state: self.state.clone(),
        })
    }
}

/// Handle to a running server, owned by the caller of [`Server::start`].
///
/// Dropping it without calling [`ServerHandle::shutdown`] stops accepting
/// new sessions but does not wait for in-flight ones.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    sessions: SessionTracker,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("active_sessions", &self.sessions.active())
            .field("state", &self.state())
            .finish()
    }
}

impl ServerHandle {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Stop accepting and wait up to `timeout` for in-flight sessions.
    ///
    /// Sessions still running at the deadline are left alone and
    /// `ShutdownTimeout` is returned. Either way the state ends `Stopped`.
    /// Calling this on a server that is already closed is a no-op.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let Some(stop) = self.stop.take() else {
            debug!("server already closed");
            return Ok(());
        };

        self.state.send_replace(LifecycleState::ShuttingDown);
        info!(
            active_sessions = self.sessions.active(),
            timeout = ?timeout,
            "Stopping SSH server"
        );

        if stop.send(()).is_err() {
            // accept 循环已经退出，同样视为已关闭
            debug!("server already closed");
        }

        let accept_task = self.accept_task.take();
        let sessions = self.sessions.clone();
        let drained = tokio::time::timeout(timeout, async move {
            if let Some(task) = accept_task {
                task.await?;
            }
            sessions.wait_idle().await;
            Ok::<_, ServerError>(())
        })
        .await;

        self.state.send_replace(LifecycleState::Stopped);

        let result = match drained {
            Ok(result) => result,
            Err(_) => Err(ServerError::ShutdownTimeout {
                timeout,
                remaining: self.sessions.active(),
            }),
        };
        match &result {
            Ok(()) => debug!("SSH server stopped"),
            Err(e) => error!(error = %e, "could not stop server"),
        }
        result
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    mut factory: SshServer,
    sessions: SessionTracker,
    mut stop: oneshot::Receiver<()>,
) {
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "accept failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            },
        };

        let handler = factory.new_client(Some(peer_addr));
        let guard = sessions.track();
        tokio::spawn(serve_connection(
            config.clone(),
            socket,
            peer_addr,
            handler,
            guard,
        ));
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    handler: SshServer,
    _guard: SessionGuard,
) {
    match russh::server::run_stream(config, socket, handler).await {
        Ok(session) => match session.await {
            Ok(()) => debug!(peer_addr = %peer_addr, "connection closed"),
            Err(e) => warn!(peer_addr = %peer_addr, error = %e, "connection error"),
        },
        Err(e) => warn!(peer_addr = %peer_addr, error = %e, "SSH handshake failed"),
    }
}
