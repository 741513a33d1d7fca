//! RPC server.
//!
//! One dedicated thread named `RpcSrv@<port>` runs a single-threaded tokio
//! runtime that owns the listening socket and every connection. Requests are
//! handed to the [`RequestListener`] and the loop moves on immediately;
//! replies are queued from any thread through [`ServerRequest`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch};

use crate::buffer::{BufferPool, BufferPoolConfig};
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::request::ServerRequest;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 32640;

const INITIAL_BIND_WAIT: Duration = Duration::from_millis(1000);
const LISTEN_BACKLOG: u32 = 1024;

/// Server configuration for the transport RPC server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Extra bind attempts while the address is in use, with doubling waits.
    pub bind_retries: u32,
    /// Socket receive buffer size in bytes.
    pub receive_buffer_size: usize,
    /// Open requests per connection above which reading pauses.
    pub max_client_q_length: usize,
    /// Whether to enable TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            bind_retries: 5,
            receive_buffer_size: 256 * 1024,
            max_client_q_length: 100,
            nodelay: true,
        }
    }
}

/// Receives every request the server decodes.
///
/// Called on the server thread, so implementations must hand the request
/// off rather than block.
pub trait RequestListener: Send + Sync + 'static {
    /// Takes ownership of a request; it is answered through its own methods.
    fn receive_request(&self, request: ServerRequest);
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) num_connections: AtomicUsize,
    pub(crate) pending_requests: AtomicUsize,
    pub(crate) total_requests: AtomicU64,
}

/// Snapshot of server statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Currently open connections.
    pub num_connections: usize,
    /// Requests received but not yet answered, over all connections.
    pub pending_requests: usize,
    /// Requests received since start.
    pub total_requests: u64,
}

/// A configured, not yet started server.
pub struct RpcServer {
    config: ServerConfig,
    listener: Arc<dyn RequestListener>,
    pool: Arc<BufferPool>,
}

impl RpcServer {
    /// Creates a server with its own buffer pool.
    pub fn new(config: ServerConfig, listener: Arc<dyn RequestListener>) -> Self {
        Self::with_pool(config, listener, BufferPool::new(BufferPoolConfig::default()))
    }

    /// Creates a server that allocates record buffers from `pool`.
    pub fn with_pool(
        config: ServerConfig,
        listener: Arc<dyn RequestListener>,
        pool: Arc<BufferPool>,
    ) -> Self {
        if config.max_client_q_length <= 1 {
            tracing::warn!(
                max_client_q_length = config.max_client_q_length,
                "request pipelining is effectively disabled"
            );
        }
        Self {
            config,
            listener,
            pool,
        }
    }

    /// Starts the server thread and waits until it is listening.
    ///
    /// Bind failures that outlast the retry budget are returned here.
    pub async fn start(self) -> Result<RpcServerHandle> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(ServerCounters::default());
        let thread_counters = Arc::clone(&counters);
        let name = format!("RpcSrv@{}", self.config.bind_addr.port());

        let thread = thread::Builder::new().name(name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(TransportError::IoError(e)));
                    return;
                }
            };
            runtime.block_on(self.run(thread_counters, ready_tx, shutdown_rx));
        })?;

        match ready_rx.await {
            Ok(Ok(local_addr)) => Ok(RpcServerHandle {
                local_addr,
                counters,
                shutdown: shutdown_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(TransportError::ServerStopped),
        }
    }

    async fn run(
        self,
        counters: Arc<ServerCounters>,
        ready: oneshot::Sender<Result<SocketAddr>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let listener = match bind(&self.config).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "could not start RPC server");
                let _ = ready.send(Err(e));
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        tracing::info!(addr = %local_addr, "RPC server listening");
        if ready.send(Ok(local_addr)).is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.config.nodelay {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
                            }
                        }
                        tracing::debug!(peer = %peer, "connect from client");
                        let connection = Connection {
                            peer,
                            max_client_q_length: self.config.max_client_q_length,
                            pool: Arc::clone(&self.pool),
                            listener: Arc::clone(&self.listener),
                            counters: Arc::clone(&counters),
                        };
                        tokio::spawn(connection.serve(stream, shutdown.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
        tracing::info!(addr = %local_addr, "RPC server shut down");
    }
}

fn try_bind(config: &ServerConfig) -> std::io::Result<TcpListener> {
    let socket = if config.bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    let size = u32::try_from(config.receive_buffer_size).unwrap_or(u32::MAX);
    if let Err(e) = socket.set_recv_buffer_size(size) {
        tracing::warn!(size, error = %e, "could not set receive buffer size");
    }
    socket.bind(config.bind_addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let mut attempt = 0;
    let mut wait = INITIAL_BIND_WAIT;
    loop {
        attempt += 1;
        match try_bind(config) {
            Ok(listener) => {
                if attempt > 1 {
                    tracing::info!(addr = %config.bind_addr, attempt, "bound after retrying");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt <= config.bind_retries => {
                tracing::warn!(
                    addr = %config.bind_addr,
                    wait_ms = wait.as_millis() as u64,
                    attempts_left = config.bind_retries + 1 - attempt,
                    "address in use, waiting for it to become free"
                );
                tokio::time::sleep(wait).await;
                wait *= 2;
            }
            Err(e) => {
                return Err(TransportError::BindFailed {
                    addr: config.bind_addr.to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// A running server.
///
/// Dropping the handle signals shutdown without waiting for the thread.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    counters: Arc<ServerCounters>,
    shutdown: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            num_connections: self.counters.num_connections.load(Ordering::SeqCst),
            pending_requests: self.counters.pending_requests.load(Ordering::SeqCst),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
        }
    }

    /// Signals the server loop to stop. Open connections are closed.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signals shutdown and waits for the server thread to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| TransportError::IoError(std::io::Error::other(e)))?
            .map_err(|_| TransportError::ServerStopped)
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
