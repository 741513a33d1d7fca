//! Record framing.
//!
//! Every record is a 12-byte marker of three big-endian `i32` lengths
//! `(header_len, message_len, data_len)` followed by exactly that many bytes
//! of header, message and data. The decoder reads each part into a pooled
//! buffer sized to its declared length; it never reads past the end of the
//! current part, so nothing beyond one record is consumed from the socket.

use std::sync::Arc;

use bytes::{BufMut, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{Result, TransportError};

/// Size of the record marker in bytes.
pub const RECORD_MARKER_SIZE: usize = 12;

/// Exclusive upper bound for every declared part length.
pub const MAX_FRAGMENT_SIZE: usize = 32 * 1024 * 1024;

/// The three part lengths preceding each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMarker {
    /// Length of the RPC header part, always positive.
    pub header_len: usize,
    /// Length of the message part, zero if absent.
    pub message_len: usize,
    /// Length of the data part, zero if absent.
    pub data_len: usize,
}

impl RecordMarker {
    /// Validates the raw lengths.
    pub fn new(header_len: i32, message_len: i32, data_len: i32) -> Result<Self> {
        let max = MAX_FRAGMENT_SIZE as i64;
        let valid = (1..max).contains(&(header_len as i64))
            && (0..max).contains(&(message_len as i64))
            && (0..max).contains(&(data_len as i64));
        if !valid {
            return Err(TransportError::InvalidRecordMarker {
                header_len,
                message_len,
                data_len,
            });
        }
        Ok(Self {
            header_len: header_len as usize,
            message_len: message_len as usize,
            data_len: data_len as usize,
        })
    }

    /// Marker for parts of the given sizes.
    pub fn for_parts(header_len: usize, message_len: usize, data_len: usize) -> Result<Self> {
        for size in [header_len, message_len, data_len] {
            if size >= MAX_FRAGMENT_SIZE {
                return Err(TransportError::PayloadTooLarge {
                    size,
                    max_size: MAX_FRAGMENT_SIZE,
                });
            }
        }
        Self::new(header_len as i32, message_len as i32, data_len as i32)
    }

    /// Parses and validates a marker.
    pub fn decode(buf: &[u8; RECORD_MARKER_SIZE]) -> Result<Self> {
        let field = |i: usize| i32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self::new(field(0), field(4), field(8))
    }

    /// Wire form of the marker.
    pub fn encode(&self) -> [u8; RECORD_MARKER_SIZE] {
        let mut out = [0u8; RECORD_MARKER_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32(self.header_len as i32);
        buf.put_i32(self.message_len as i32);
        buf.put_i32(self.data_len as i32);
        out
    }

    /// Marker plus all parts.
    pub fn record_size(&self) -> usize {
        RECORD_MARKER_SIZE + self.header_len + self.message_len + self.data_len
    }
}

/// A fully received record. Empty message or data parts are `None`.
#[derive(Debug)]
pub struct Record {
    /// Header part.
    pub header: PooledBuffer,
    /// Message part.
    pub message: Option<PooledBuffer>,
    /// Data part.
    pub data: Option<PooledBuffer>,
}

/// Which part of a record is being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// The 12-byte marker.
    RecordMarker,
    /// The header part.
    RpcHeader,
    /// The message part.
    RpcMessage,
    /// The data part.
    Data,
}

/// Incremental record decoder.
///
/// Callers read into [`unfilled`](Self::unfilled) and report the byte count
/// through [`filled`](Self::filled) until a record comes out.
#[derive(Debug)]
pub struct RecordDecoder {
    pool: Arc<BufferPool>,
    state: ReceiveState,
    marker: [u8; RECORD_MARKER_SIZE],
    pos: usize,
    header: Option<PooledBuffer>,
    message: Option<PooledBuffer>,
    data: Option<PooledBuffer>,
}

impl RecordDecoder {
    /// Decoder allocating its part buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            state: ReceiveState::RecordMarker,
            marker: [0; RECORD_MARKER_SIZE],
            pos: 0,
            header: None,
            message: None,
            data: None,
        }
    }

    /// Part currently being received.
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// True between records.
    pub fn is_idle(&self) -> bool {
        self.state == ReceiveState::RecordMarker && self.pos == 0
    }

    fn target(&mut self) -> &mut [u8] {
        match self.state {
            ReceiveState::RecordMarker => &mut self.marker[..],
            ReceiveState::RpcHeader => self.header.as_deref_mut().unwrap_or_default(),
            ReceiveState::RpcMessage => self.message.as_deref_mut().unwrap_or_default(),
            ReceiveState::Data => self.data.as_deref_mut().unwrap_or_default(),
        }
    }

    /// The not yet received remainder of the current part.
    pub fn unfilled(&mut self) -> &mut [u8] {
        let pos = self.pos;
        &mut self.target()[pos..]
    }

    /// Accounts for `n` bytes written into [`unfilled`](Self::unfilled).
    ///
    /// Returns the record once its last part is complete. An invalid marker
    /// is an error; the decoder must not be used afterwards.
    pub fn filled(&mut self, n: usize) -> Result<Option<Record>> {
        self.pos += n;
        let len = self.target().len();
        if self.pos < len {
            return Ok(None);
        }
        self.pos = 0;

        match self.state {
            ReceiveState::RecordMarker => {
                let marker = RecordMarker::decode(&self.marker)?;
                self.header = Some(self.pool.allocate(marker.header_len));
                self.message =
                    (marker.message_len > 0).then(|| self.pool.allocate(marker.message_len));
                self.data = (marker.data_len > 0).then(|| self.pool.allocate(marker.data_len));
                self.state = ReceiveState::RpcHeader;
                return Ok(None);
            }
            ReceiveState::RpcHeader if self.message.is_some() => {
                self.state = ReceiveState::RpcMessage;
                return Ok(None);
            }
            ReceiveState::RpcHeader | ReceiveState::RpcMessage if self.data.is_some() => {
                self.state = ReceiveState::Data;
                return Ok(None);
            }
            ReceiveState::RpcHeader | ReceiveState::RpcMessage | ReceiveState::Data => {}
        }

        self.state = ReceiveState::RecordMarker;
        match self.header.take() {
            Some(header) => Ok(Some(Record {
                header,
                message: self.message.take(),
                data: self.data.take(),
            })),
            None => Err(TransportError::MalformedHeader {
                reason: "record completed without header".into(),
            }),
        }
    }

    /// Decodes as many complete records as `input` holds, for tests and
    /// in-memory transports.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while !input.is_empty() {
            let dst = self.unfilled();
            let n = dst.len().min(input.len());
            dst[..n].copy_from_slice(&input[..n]);
            input = &input[n..];
            if let Some(record) = self.filled(n)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// A record queued for sending.
///
/// The parts are released once the last byte is written. `T` rides along
/// with the record and is dropped with it.
#[derive(Debug)]
pub struct OutgoingRecord<T = ()> {
    marker: RecordMarker,
    header: Vec<u8>,
    message: Bytes,
    data: Bytes,
    attachment: T,
}

impl OutgoingRecord<()> {
    /// Frames the three parts.
    pub fn new(header: Vec<u8>, message: Bytes, data: Bytes) -> Result<Self> {
        Self::with_attachment(header, message, data, ())
    }
}

impl<T> OutgoingRecord<T> {
    /// Frames the three parts, keeping `attachment` alive until sent.
    pub fn with_attachment(
        header: Vec<u8>,
        message: Bytes,
        data: Bytes,
        attachment: T,
    ) -> Result<Self> {
        let marker = RecordMarker::for_parts(header.len(), message.len(), data.len())?;
        Ok(Self {
            marker,
            header,
            message,
            data,
            attachment,
        })
    }

    /// Bytes this record occupies on the wire.
    pub fn expected_size(&self) -> usize {
        self.marker.record_size()
    }

    /// Writes the whole record.
    ///
    /// Fails with [`TransportError::RecordOverrun`] if the parts hold more
    /// bytes than the marker declares.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<usize> {
        let expected = self.expected_size();
        let marker = self.marker.encode();
        let mut written = 0;
        for part in [&marker[..], &self.header[..], &self.message[..], &self.data[..]] {
            if written + part.len() > expected {
                return Err(TransportError::RecordOverrun {
                    expected,
                    written: written + part.len(),
                });
            }
            writer.write_all(part).await?;
            written += part.len();
        }
        if written != expected {
            return Err(TransportError::RecordOverrun { expected, written });
        }
        Ok(written)
    }

    /// Encodes the record into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.expected_size());
        out.extend_from_slice(&self.marker.encode());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.message);
        out.extend_from_slice(&self.data);
        out
    }

    /// The value carried along with the record.
    pub fn attachment(&self) -> &T {
        &self.attachment
    }

    /// Gives up the framed bytes and returns the attachment.
    pub fn into_attachment(self) -> T {
        self.attachment
    }
}
