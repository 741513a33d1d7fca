//! Requests handed to the application and their replies.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::buffer::PooledBuffer;
use crate::connection::ConnectionShared;
use crate::error::{Result, TransportError};
use crate::header::{ErrorResponse, RequestHeader, RpcHeader};
use crate::record::OutgoingRecord;

/// One open request on a connection.
///
/// Dropping the slot closes the request: the connection's open count goes
/// down and reading resumes once it is back at the threshold. A slot travels
/// with the response record, so it is dropped after the last byte is written.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    conn: Arc<ConnectionShared>,
}

impl RequestSlot {
    pub(crate) fn open(conn: Arc<ConnectionShared>) -> Self {
        conn.open_requests.fetch_add(1, Ordering::SeqCst);
        conn.counters.pending_requests.fetch_add(1, Ordering::SeqCst);
        conn.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        Self { conn }
    }
}

impl Drop for RequestSlot {
    fn drop(&mut self) {
        let open = self.conn.open_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        self.conn
            .counters
            .pending_requests
            .fetch_sub(1, Ordering::SeqCst);
        if open <= self.conn.resume_threshold {
            self.conn.resume.notify_one();
        }
    }
}

pub(crate) type QueuedResponse = OutgoingRecord<RequestSlot>;

/// A request received by the server.
///
/// The message and data buffers belong to the request and are released when
/// it is answered or dropped. A request dropped without an answer still
/// frees its slot, but the client never gets a reply.
pub struct ServerRequest {
    header: RpcHeader,
    message: Option<PooledBuffer>,
    data: Option<PooledBuffer>,
    received_at: Instant,
    slot: RequestSlot,
}

impl ServerRequest {
    pub(crate) fn new(
        header: RpcHeader,
        message: Option<PooledBuffer>,
        data: Option<PooledBuffer>,
        slot: RequestSlot,
    ) -> Self {
        Self {
            header,
            message,
            data,
            received_at: Instant::now(),
            slot,
        }
    }

    /// The decoded record header.
    pub fn header(&self) -> &RpcHeader {
        &self.header
    }

    /// Request fields of the header.
    pub fn request_header(&self) -> Option<&RequestHeader> {
        self.header.request_header()
    }

    /// Call id to answer.
    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Message part, empty if absent.
    pub fn message(&self) -> &[u8] {
        self.message.as_deref().unwrap_or_default()
    }

    /// Data part, empty if absent.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Remote address of the connection the request came in on.
    pub fn peer_addr(&self) -> SocketAddr {
        self.slot.conn.peer
    }

    /// Time since the record was fully received.
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Replies with success.
    pub fn send_response(self, message: Bytes, data: Bytes) -> Result<()> {
        let header = RpcHeader::success(self.call_id());
        self.send(header, message, data)
    }

    /// Replies with an error.
    pub fn send_error(self, error: ErrorResponse) -> Result<()> {
        let header = RpcHeader::error(self.call_id(), error);
        self.send(header, Bytes::new(), Bytes::new())
    }

    fn send(self, header: RpcHeader, message: Bytes, data: Bytes) -> Result<()> {
        let ServerRequest { slot, .. } = self;
        let conn = Arc::clone(&slot.conn);
        let record = OutgoingRecord::with_attachment(header.encode()?, message, data, slot)?;
        conn.responses
            .send(record)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("header", &self.header)
            .field("message_len", &self.message().len())
            .field("data_len", &self.data().len())
            .field("peer", &self.slot.conn.peer)
            .finish()
    }
}
