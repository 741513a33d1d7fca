#![warn(missing_docs)]

//! LeaseFS transport subsystem: record-framed async RPC server engine, buffer pool, RPC client

/// Pooled record buffers
pub mod buffer;
/// RPC client
pub mod client;
mod connection;
/// Error types
#[allow(missing_docs)]
pub mod error;
/// RPC record header
pub mod header;
/// Record marker framing and incremental decoding
pub mod record;
/// Server requests and replies
pub mod request;
/// RPC server engine
pub mod server;

pub use buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, PooledBuffer};
pub use client::{RpcClient, RpcClientConfig, RpcResponse};
pub use error::{Result, TransportError};
pub use header::{Auth, ErrorResponse, ErrorType, HeaderBody, MessageType, RequestHeader, RpcHeader, UserCredentials};
pub use record::{OutgoingRecord, Record, RecordDecoder, RecordMarker, MAX_FRAGMENT_SIZE, RECORD_MARKER_SIZE};
pub use request::ServerRequest;
pub use server::{RequestListener, RpcServer, RpcServerHandle, ServerConfig, ServerStats};
