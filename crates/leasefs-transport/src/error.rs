use thiserror::Error;

use crate::header::ErrorType;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid record marker size ({header_len}/{message_len}/{data_len})")]
    InvalidRecordMarker {
        header_len: i32,
        message_len: i32,
        data_len: i32,
    },

    #[error("malformed RPC header: {reason}")]
    MalformedHeader { reason: String },

    #[error("record overrun: wrote {written} bytes of a {expected} byte record")]
    RecordOverrun { expected: usize, written: usize },

    #[error("record part of {size} bytes exceeds fragment limit of {max_size}")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("failed to bind {addr} after {attempts} attempt(s): {reason}")]
    BindFailed {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("call {call_id} timed out after {timeout_ms}ms")]
    RequestTimeout { call_id: u32, timeout_ms: u64 },

    #[error("remote error {error_type:?}: {message}")]
    Remote { error_type: ErrorType, message: String },

    #[error("server stopped")]
    ServerStopped,

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
