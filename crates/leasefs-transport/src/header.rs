//! RPC record header.
//!
//! The header part of every record is an [`RpcHeader`] encoded with bincode
//! (fixed-width integers, trailing bytes rejected).

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::record::MAX_FRAGMENT_SIZE;

/// Kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Call from a client.
    Request,
    /// Successful reply.
    ResponseSuccess,
    /// Failed reply, the header carries an [`ErrorResponse`].
    ResponseError,
}

/// Caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    /// User name.
    pub username: String,
    /// Group names.
    pub groups: Vec<String>,
}

/// Authentication scheme and its opaque data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Auth {
    /// No authentication.
    #[default]
    None,
    /// Shared password.
    Password(String),
}

/// Header fields of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Service interface.
    pub interface_id: u32,
    /// Procedure within the interface.
    pub proc_id: u32,
    /// Caller identity.
    pub user_creds: UserCredentials,
    /// Caller authentication.
    pub auth: Auth,
}

/// Error categories reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// No such interface.
    InvalidInterfaceId,
    /// No such procedure in the interface.
    InvalidProcId,
    /// Message or data could not be parsed.
    GarbageArgs,
    /// Authentication rejected.
    AuthFailed,
    /// Handler failed.
    InternalServerError,
    /// Operation failed with an errno.
    Errno,
    /// Retry at another server.
    Redirect,
    /// I/O failure on the server.
    IoError,
}

/// Header fields of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error category.
    pub error_type: ErrorType,
    /// Human-readable message.
    pub message: String,
    /// Optional details for debugging.
    pub debug_info: String,
}

impl ErrorResponse {
    /// Error with an empty debug section.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            debug_info: String::new(),
        }
    }
}

/// Type-specific part of the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderBody {
    /// Request fields.
    Request(RequestHeader),
    /// Error reply fields.
    Error(ErrorResponse),
    /// Successful replies carry nothing extra.
    Empty,
}

/// Header part of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Matches a reply to its request.
    pub call_id: u32,
    /// Kind of record.
    pub message_type: MessageType,
    /// Type-specific fields.
    pub body: HeaderBody,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAGMENT_SIZE as u64)
}

impl RpcHeader {
    /// Request header.
    pub fn request(call_id: u32, interface_id: u32, proc_id: u32) -> Self {
        Self {
            call_id,
            message_type: MessageType::Request,
            body: HeaderBody::Request(RequestHeader {
                interface_id,
                proc_id,
                user_creds: UserCredentials::default(),
                auth: Auth::None,
            }),
        }
    }

    /// Success reply header.
    pub fn success(call_id: u32) -> Self {
        Self {
            call_id,
            message_type: MessageType::ResponseSuccess,
            body: HeaderBody::Empty,
        }
    }

    /// Error reply header.
    pub fn error(call_id: u32, error: ErrorResponse) -> Self {
        Self {
            call_id,
            message_type: MessageType::ResponseError,
            body: HeaderBody::Error(error),
        }
    }

    /// Request fields, if this is a request.
    pub fn request_header(&self) -> Option<&RequestHeader> {
        match &self.body {
            HeaderBody::Request(rq) => Some(rq),
            _ => None,
        }
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Decode from exactly the header part of a record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header: RpcHeader =
            codec()
                .deserialize(buf)
                .map_err(|e| TransportError::MalformedHeader {
                    reason: e.to_string(),
                })?;
        let consistent = matches!(
            (&header.message_type, &header.body),
            (MessageType::Request, HeaderBody::Request(_))
                | (MessageType::ResponseSuccess, HeaderBody::Empty)
                | (MessageType::ResponseError, HeaderBody::Error(_))
        );
        if !consistent {
            return Err(TransportError::MalformedHeader {
                reason: format!("{:?} record with mismatched body", header.message_type),
            });
        }
        Ok(header)
    }
}
