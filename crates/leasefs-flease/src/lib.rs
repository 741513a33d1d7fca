#![warn(missing_docs)]

//! LeaseFS lease subsystem: Flease lease consensus, local acceptor, proposer state machine, stage driver

/// Local acceptor answering PREPARE/ACCEPT/LEARN
pub mod acceptor;
/// Collaborator interfaces: transport, timers, listeners, master epoch pipeline, clocks
pub mod comm;
/// Protocol timing and identity options
pub mod config;
/// Master epoch stores
pub mod epoch;
/// Error types
pub mod error;
/// Proposer state machine
pub mod proposer;
/// Single-task stage driver
pub mod stage;
/// Message, ballot, cell and lease value types
pub mod types;

pub use acceptor::FleaseAcceptor;
pub use comm::{Clock, FleaseComm, FleaseListener, ManualClock, MasterEpochHandler, SystemClock};
pub use config::FleaseConfig;
pub use error::{FleaseError, Result};
pub use proposer::{CellState, FleaseProposer};
pub use stage::{
    FleaseMessageSender, FleaseStageHandle, FleaseStatusListener, FleaseViewChangeListener,
    StageBuilder, StageCore,
};
pub use types::{CellId, Flease, FleaseMessage, MessageKind, ProposalNumber};
