use thiserror::Error;

use crate::types::CellId;

/// Errors produced by the Flease proposer, acceptor and stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleaseError {
    /// `open_cell` was called for a cell that is already open.
    #[error("cell {0} already opened")]
    CellAlreadyOpen(CellId),

    /// The cell is not open on this proposer.
    #[error("cell {0} is not open")]
    CellNotOpen(CellId),

    /// Renew or handover was attempted without a locally learned lease.
    #[error("cannot {op} lease, no local lease information")]
    NoLocalLease {
        /// Operation that was attempted ("renew" or "handover").
        op: &'static str,
    },

    /// Renew or handover was attempted by a node that does not hold the lease.
    #[error("cannot {op} lease, not lease owner (owner is {owner})")]
    NotOwner {
        /// Operation that was attempted.
        op: &'static str,
        /// Current holder according to the local acceptor.
        owner: String,
    },

    /// The local lease has already timed out.
    #[error("cannot renew lease, lease already timed out: {timeout_ms} < {now_ms}")]
    LeaseTimedOut {
        /// Lease timeout minus the clock skew bound.
        timeout_ms: i64,
        /// Current global time.
        now_ms: i64,
    },

    /// Too little time is left before the lease expires to complete a round.
    #[error("cannot {op} lease, not enough time left: {timeout_ms} < {deadline_ms}")]
    NotEnoughTime {
        /// Operation that was attempted.
        op: &'static str,
        /// Lease timeout minus the clock skew bound.
        timeout_ms: i64,
        /// Current global time plus two round timeouts.
        deadline_ms: i64,
    },

    /// A handover of the cell is already in progress.
    #[error("handover in progress for cell {0}")]
    HandoverInProgress(CellId),

    /// A response carried a timestamp further than `d_max` in the future.
    #[error("system is not in sync (clock sync drift exceeded)")]
    ClockOutOfSync,

    /// A round could not be completed.
    #[error("{reason}")]
    RoundFailed {
        /// Human readable cause.
        reason: String,
    },

    /// The proposer reached a state the driver must never produce.
    #[error("invalid state in cell {cell}: {detail}")]
    InvalidState {
        /// Affected cell.
        cell: CellId,
        /// What was violated.
        detail: String,
    },

    /// A cell exhausted its retry budget. Carries the cell's action history.
    #[error("{source_message} (cell trace: {trace})")]
    LeaseFailed {
        /// Message of the error that caused the last failure.
        source_message: String,
        /// Debug rendering of the cell including recent actions.
        trace: String,
    },

    /// A flease message could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The stage is not running any more.
    #[error("flease stage stopped")]
    StageStopped,

    /// Local I/O failed (lock file, epoch store).
    #[error("io error: {0}")]
    Io(String),
}

impl FleaseError {
    /// Shorthand for [`FleaseError::RoundFailed`].
    pub fn round(reason: impl Into<String>) -> Self {
        FleaseError::RoundFailed {
            reason: reason.into(),
        }
    }

    /// Wraps this error together with the cell's debug trace for `lease_failed`.
    pub fn with_cell_trace(self, trace: String) -> Self {
        FleaseError::LeaseFailed {
            source_message: self.to_string(),
            trace,
        }
    }
}

impl From<std::io::Error> for FleaseError {
    fn from(err: std::io::Error) -> Self {
        FleaseError::Io(err.to_string())
    }
}

/// Result type for Flease operations.
pub type Result<T> = std::result::Result<T, FleaseError>;
