//! Per-connection receive and send loops.
//!
//! Receiving runs on the connection task: it reads one record part at a time,
//! turns complete records into [`ServerRequest`]s and stops reading while the
//! connection has more than `max_client_q_length` open requests. Sending runs
//! on a companion task that drains the connection's response queue in order;
//! it sleeps whenever the queue is empty.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};

use crate::buffer::BufferPool;
use crate::error::{Result, TransportError};
use crate::header::{MessageType, RpcHeader};
use crate::record::RecordDecoder;
use crate::request::{QueuedResponse, RequestSlot, ServerRequest};
use crate::server::{RequestListener, ServerCounters};

/// State shared by a connection's loops and its open requests.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub(crate) peer: SocketAddr,
    pub(crate) open_requests: AtomicUsize,
    pub(crate) resume_threshold: usize,
    pub(crate) resume: Notify,
    pub(crate) responses: mpsc::UnboundedSender<QueuedResponse>,
    pub(crate) counters: Arc<ServerCounters>,
}

struct ConnectionGuard(Arc<ServerCounters>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.num_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    pub(crate) max_client_q_length: usize,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) listener: Arc<dyn RequestListener>,
    pub(crate) counters: Arc<ServerCounters>,
}

impl Connection {
    /// Serves `stream` until the peer disconnects, a protocol error occurs or
    /// the server shuts down.
    pub(crate) async fn serve(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        self.counters.num_connections.fetch_add(1, Ordering::SeqCst);
        let _guard = ConnectionGuard(Arc::clone(&self.counters));

        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared {
            peer: self.peer,
            open_requests: AtomicUsize::new(0),
            resume_threshold: self.max_client_q_length / 2,
            resume: Notify::new(),
            responses: tx,
            counters: Arc::clone(&self.counters),
        });
        let mut writer_task = tokio::spawn(write_loop(writer, rx, self.peer));

        let result = tokio::select! {
            result = self.read_loop(&mut reader, &shared, &mut shutdown) => result,
            _ = &mut writer_task => Err(TransportError::ConnectionClosed),
        };
        writer_task.abort();

        match result {
            Ok(()) => tracing::debug!(peer = %self.peer, "connection closed"),
            Err(e @ TransportError::InvalidRecordMarker { .. }) => {
                tracing::error!(peer = %self.peer, error = %e, "closing connection to client");
            }
            Err(e @ TransportError::MalformedHeader { .. }) => {
                tracing::error!(peer = %self.peer, error = %e, "invalid RPC header received, closing connection");
            }
            Err(e) => tracing::debug!(peer = %self.peer, error = %e, "connection closed"),
        }
    }

    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        shared: &Arc<ConnectionShared>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut decoder = RecordDecoder::new(Arc::clone(&self.pool));
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if shared.open_requests.load(Ordering::SeqCst) > self.max_client_q_length {
                tracing::warn!(
                    peer = %self.peer,
                    q = shared.open_requests.load(Ordering::SeqCst),
                    "client sent too many requests, not accepting new requests"
                );
                if !wait_for_resume(shared, shutdown).await {
                    return Ok(());
                }
                tracing::warn!(
                    peer = %self.peer,
                    q = shared.open_requests.load(Ordering::SeqCst),
                    "client allowed to send data again"
                );
            }

            let n = tokio::select! {
                read = reader.read(decoder.unfilled()) => read?,
                _ = shutdown.changed() => return Ok(()),
            };
            if n == 0 {
                if !decoder.is_idle() {
                    tracing::debug!(peer = %self.peer, state = ?decoder.state(), "EOF inside a record");
                }
                return Ok(());
            }
            let Some(record) = decoder.filled(n)? else {
                continue;
            };

            let header = RpcHeader::decode(&record.header)?;
            if header.message_type != MessageType::Request {
                return Err(TransportError::MalformedHeader {
                    reason: format!("expected a request, got {:?}", header.message_type),
                });
            }
            let slot = RequestSlot::open(Arc::clone(shared));
            let request = ServerRequest::new(header, record.message, record.data, slot);
            self.listener.receive_request(request);
        }
    }
}

/// Waits until the open request count is back at the resume threshold.
/// Returns false on shutdown.
async fn wait_for_resume(shared: &ConnectionShared, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        let notified = shared.resume.notified();
        if shared.open_requests.load(Ordering::SeqCst) <= shared.resume_threshold {
            return true;
        }
        tokio::select! {
            _ = notified => {}
            _ = shutdown.changed() => return false,
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut responses: mpsc::UnboundedReceiver<QueuedResponse>,
    peer: SocketAddr,
) {
    let mut writer = BufWriter::new(writer);
    // Slots of responses still sitting in the buffer; released once flushed.
    let mut unflushed: Vec<RequestSlot> = Vec::new();
    while let Some(response) = responses.recv().await {
        let mut result = response.write_to(&mut writer).await.map(|_| ());
        let bytes = response.expected_size();
        unflushed.push(response.into_attachment());
        if result.is_ok() && responses.is_empty() {
            result = writer.flush().await.map_err(TransportError::from);
            if result.is_ok() {
                unflushed.clear();
            }
        }
        if let Err(e) = result {
            match e {
                TransportError::RecordOverrun { .. } => {
                    tracing::error!(peer = %peer, error = %e, "response framing error, closing connection");
                }
                _ => tracing::debug!(peer = %peer, error = %e, "could not send response"),
            }
            let _ = writer.shutdown().await;
            return;
        }
        tracing::trace!(peer = %peer, bytes, "sent response");
    }
}
