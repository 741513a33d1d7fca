//! Flease messages carried over the RPC transport.
//!
//! A message travels as one request: the message part holds the sender's
//! advertised address as UTF-8, the data part holds the encoded
//! [`FleaseMessage`]. The receiver acknowledges with an empty success reply
//! before the message reaches its stage, so replies never wait on the
//! protocol.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use leasefs_flease::{FleaseMessage, FleaseMessageSender, FleaseStageHandle};
use leasefs_transport::{ErrorResponse, ErrorType, RequestListener, RpcClient, ServerRequest};
use tokio::runtime::Handle;

/// Interface id of flease traffic.
pub const FLEASE_INTERFACE_ID: u32 = 30001;

/// Procedure carrying one flease message.
pub const FLEASE_MSG_PROC: u32 = 1;

/// Sends stage output to peers, one fire-and-forget RPC per message.
pub struct RpcMessageSender {
    client: Arc<RpcClient>,
    local_addr: Bytes,
    runtime: Handle,
}

impl RpcMessageSender {
    /// Creates a sender that announces `local_addr` as the reply address.
    pub fn new(client: Arc<RpcClient>, local_addr: SocketAddr, runtime: Handle) -> Self {
        Self {
            client,
            local_addr: Bytes::from(local_addr.to_string()),
            runtime,
        }
    }
}

impl FleaseMessageSender for RpcMessageSender {
    fn send_message(&mut self, message: FleaseMessage, receiver: SocketAddr) {
        let client = Arc::clone(&self.client);
        let sender = self.local_addr.clone();
        let data = Bytes::from(message.to_bytes());
        let kind = message.kind;
        self.runtime.spawn(async move {
            if let Err(e) = client
                .call(receiver, FLEASE_INTERFACE_ID, FLEASE_MSG_PROC, sender, data)
                .await
            {
                tracing::debug!(peer = %receiver, ?kind, error = %e, "flease message not delivered");
            }
        });
    }
}

/// Hands flease requests received by the RPC server to the stage.
///
/// The server has to be listening before the stage can be built, so the stage
/// is attached afterwards. Requests that arrive before that are answered with
/// an internal error.
#[derive(Default)]
pub struct FleaseRequestListener {
    stage: OnceLock<FleaseStageHandle>,
}

impl FleaseRequestListener {
    /// Creates a listener with no stage attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the stage. Returns false if one was already attached.
    pub fn attach(&self, stage: FleaseStageHandle) -> bool {
        self.stage.set(stage).is_ok()
    }

    fn reject(request: ServerRequest, error_type: ErrorType, message: String) {
        let peer = request.peer_addr();
        tracing::debug!(peer = %peer, ?error_type, %message, "rejecting flease request");
        if let Err(e) = request.send_error(ErrorResponse::new(error_type, message)) {
            tracing::debug!(peer = %peer, error = %e, "could not send error reply");
        }
    }
}

impl RequestListener for FleaseRequestListener {
    fn receive_request(&self, request: ServerRequest) {
        let Some(header) = request.request_header() else {
            Self::reject(request, ErrorType::GarbageArgs, String::from("missing request header"));
            return;
        };
        if header.interface_id != FLEASE_INTERFACE_ID {
            let message = format!("unknown interface id {}", header.interface_id);
            Self::reject(request, ErrorType::InvalidInterfaceId, message);
            return;
        }
        if header.proc_id != FLEASE_MSG_PROC {
            let message = format!("unknown procedure {}", header.proc_id);
            Self::reject(request, ErrorType::InvalidProcId, message);
            return;
        }

        let sender = std::str::from_utf8(request.message())
            .ok()
            .and_then(|s| s.parse::<SocketAddr>().ok());
        let Some(sender) = sender else {
            Self::reject(request, ErrorType::GarbageArgs, String::from("invalid sender address"));
            return;
        };
        let mut message = match FleaseMessage::decode(request.data()) {
            Ok(message) => message,
            Err(e) => {
                Self::reject(request, ErrorType::GarbageArgs, e.to_string());
                return;
            }
        };
        let Some(stage) = self.stage.get() else {
            Self::reject(
                request,
                ErrorType::InternalServerError,
                String::from("flease stage not running"),
            );
            return;
        };

        if let Err(e) = request.send_response(Bytes::new(), Bytes::new()) {
            tracing::debug!(peer = %sender, error = %e, "could not acknowledge flease message");
        }
        message.sender = Some(sender);
        if let Err(e) = stage.receive_message(message) {
            tracing::warn!(peer = %sender, error = %e, "dropping flease message");
        }
    }
}
