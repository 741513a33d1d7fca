//! RPC client for sending requests and receiving responses.
//!
//! Keeps one connection per peer. Each connection has a background reader
//! task that matches responses to pending calls by call id; when the
//! connection breaks every pending call fails and the next call reconnects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::buffer::{BufferPool, BufferPoolConfig, PooledBuffer};
use crate::error::{Result, TransportError};
use crate::header::{HeaderBody, MessageType, RpcHeader};
use crate::record::{OutgoingRecord, RecordDecoder};

/// Configuration for RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Connection timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// Response timeout in milliseconds (default: 5000).
    pub request_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// A successful reply.
#[derive(Debug)]
pub struct RpcResponse {
    /// Reply header.
    pub header: RpcHeader,
    message: Option<PooledBuffer>,
    data: Option<PooledBuffer>,
}

impl RpcResponse {
    /// Message part, empty if absent.
    pub fn message(&self) -> &[u8] {
        self.message.as_deref().unwrap_or_default()
    }

    /// Data part, empty if absent.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    fn into_result(self) -> Result<Self> {
        match &self.header.body {
            HeaderBody::Error(error) => Err(TransportError::Remote {
                error_type: error.error_type,
                message: error.message.clone(),
            }),
            _ => Ok(self),
        }
    }
}

type Pending = DashMap<u32, oneshot::Sender<RpcResponse>>;

struct ClientConnection {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ClientConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, record: &OutgoingRecord) -> Result<()> {
        let mut writer = self.writer.lock().await;
        record.write_to(&mut *writer).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// RPC client shared by all callers of a node.
pub struct RpcClient {
    config: RpcClientConfig,
    pool: Arc<BufferPool>,
    connections: DashMap<SocketAddr, Arc<ClientConnection>>,
    next_call_id: AtomicU32,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(config: RpcClientConfig) -> Self {
        Self::with_pool(config, BufferPool::new(BufferPoolConfig::default()))
    }

    /// Create a client that allocates response buffers from `pool`.
    pub fn with_pool(config: RpcClientConfig, pool: Arc<BufferPool>) -> Self {
        Self {
            config,
            pool,
            connections: DashMap::new(),
            next_call_id: AtomicU32::new(1),
        }
    }

    /// Number of cached connections.
    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Sends a request and waits for its reply.
    ///
    /// An error reply becomes [`TransportError::Remote`].
    pub async fn call(
        &self,
        addr: SocketAddr,
        interface_id: u32,
        proc_id: u32,
        message: Bytes,
        data: Bytes,
    ) -> Result<RpcResponse> {
        let conn = self.connection(addr).await?;
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let header = RpcHeader::request(call_id, interface_id, proc_id).encode()?;
        let record = OutgoingRecord::new(header, message, data)?;

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(call_id, tx);
        if conn.is_closed() {
            conn.pending.remove(&call_id);
            self.forget(addr, &conn);
            return Err(TransportError::ConnectionClosed);
        }
        if let Err(e) = conn.send(&record).await {
            conn.pending.remove(&call_id);
            self.forget(addr, &conn);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                conn.pending.remove(&call_id);
                Err(TransportError::RequestTimeout {
                    call_id,
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
        }
    }

    fn forget(&self, addr: SocketAddr, conn: &Arc<ClientConnection>) {
        self.connections
            .remove_if(&addr, |_, cached| Arc::ptr_eq(cached, conn));
    }

    async fn connection(&self, addr: SocketAddr) -> Result<Arc<ClientConnection>> {
        let cached = self.connections.get(&addr).map(|c| Arc::clone(c.value()));
        if let Some(conn) = cached {
            if !conn.is_closed() {
                return Ok(conn);
            }
            self.forget(addr, &conn);
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(peer = %addr, "RPC client connected");

        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Pending::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(
            reader,
            Arc::clone(&self.pool),
            Arc::clone(&pending),
            Arc::clone(&closed),
            addr,
        ));
        let conn = Arc::new(ClientConnection {
            writer: Mutex::new(BufWriter::new(writer)),
            pending,
            closed,
            reader,
        });
        self.connections.insert(addr, Arc::clone(&conn));
        Ok(conn)
    }
}

async fn read_responses(
    mut reader: OwnedReadHalf,
    pool: Arc<BufferPool>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    addr: SocketAddr,
) {
    if let Err(e) = read_loop(&mut reader, pool, &pending).await {
        tracing::debug!(peer = %addr, error = %e, "RPC client connection closed");
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails the waiting calls.
    pending.clear();
}

async fn read_loop(reader: &mut OwnedReadHalf, pool: Arc<BufferPool>, pending: &Pending) -> Result<()> {
    let mut decoder = RecordDecoder::new(pool);
    loop {
        let n = reader.read(decoder.unfilled()).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        let Some(record) = decoder.filled(n)? else {
            continue;
        };
        let header = RpcHeader::decode(&record.header)?;
        if header.message_type == MessageType::Request {
            return Err(TransportError::MalformedHeader {
                reason: "request received on a client connection".into(),
            });
        }
        match pending.remove(&header.call_id) {
            Some((_, tx)) => {
                let _ = tx.send(RpcResponse {
                    header,
                    message: record.message,
                    data: record.data,
                });
            }
            None => tracing::debug!(call_id = header.call_id, "response for unknown or expired call"),
        }
    }
}
