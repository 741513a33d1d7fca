//! LeaseFS node: configuration, flease over RPC, lease table

pub mod cli;
pub mod config;
pub mod flease_rpc;
pub mod leases;
pub mod node;

pub use config::{NodeConfig, NodeSection};
pub use flease_rpc::{FleaseRequestListener, RpcMessageSender, FLEASE_INTERFACE_ID, FLEASE_MSG_PROC};
pub use leases::{LeaseEvent, LeaseTable};
pub use node::Node;
