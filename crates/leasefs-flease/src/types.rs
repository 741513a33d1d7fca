//! Value types shared by the acceptor, the proposer and the stage.
//!
//! Messages are plain values: they are built once, optionally adjusted while a
//! round assembles them, and never mutated after they have been handed to the
//! communication layer.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use crate::config::FleaseConfig;
use crate::error::{FleaseError, Result};

/// View id of a cell whose view has been invalidated.
pub const VIEW_ID_INVALIDATED: i32 = -1;

/// Master epoch value meaning "no epoch attached".
pub const IGNORE_MASTER_EPOCH: i64 = -1;

/// Master epoch value a PREPARE carries to request the acceptors' epochs.
pub const REQUEST_MASTER_EPOCH: i64 = 0;

/// Opaque key naming a lease cell.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(Vec<u8>);

impl CellId {
    /// Creates a cell id from raw bytes.
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        CellId(id.into())
    }

    /// Returns the raw bytes of this cell id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        CellId(s.as_bytes().to_vec())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Paxos ballot: ordered by sequence, then by sender id.
///
/// [`ProposalNumber::EMPTY`] orders before every other proposal number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalNumber {
    sequence: i64,
    sender_id: i32,
}

impl ProposalNumber {
    /// The "no proposal" sentinel.
    pub const EMPTY: ProposalNumber = ProposalNumber {
        sequence: 0,
        sender_id: 0,
    };

    /// Creates a proposal number.
    pub fn new(sequence: i64, sender_id: i32) -> Self {
        ProposalNumber {
            sequence,
            sender_id,
        }
    }

    /// Sequence part of the ballot.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Id of the proposer that owns this ballot.
    pub fn sender_id(&self) -> i32 {
        self.sender_id
    }

    /// True for the [`ProposalNumber::EMPTY`] sentinel.
    pub fn is_empty(&self) -> bool {
        *self == ProposalNumber::EMPTY
    }

    /// Same sender, sequence plus `delta`.
    pub fn bumped(&self, delta: i64) -> Self {
        ProposalNumber::new(self.sequence.saturating_add(delta), self.sender_id)
    }

    /// True if `self < other`.
    pub fn before(&self, other: &ProposalNumber) -> bool {
        self < other
    }

    /// True if `self > other`.
    pub fn after(&self, other: &ProposalNumber) -> bool {
        self > other
    }
}

impl Ord for ProposalNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self
                .sequence
                .cmp(&other.sequence)
                .then(self.sender_id.cmp(&other.sender_id)),
        }
    }
}

impl PartialOrd for ProposalNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sequence, self.sender_id)
    }
}

/// Flease message kinds. The discriminant order is the wire ordinal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Phase one request.
    Prepare,
    /// Phase one promise, may carry the previously accepted value.
    PrepareAck,
    /// Phase one rejection carrying the competing ballot.
    PrepareNack,
    /// Phase two request.
    Accept,
    /// Phase two acceptance.
    AcceptAck,
    /// Phase two rejection carrying the competing ballot.
    AcceptNack,
    /// Announcement of a chosen lease.
    Learn,
    /// The acceptor's view differs from the proposer's.
    WrongView,
    /// Timer: start a new round.
    EventRestart,
    /// Timer: renew the lease held by this node.
    EventRenew,
    /// Timer: the PREPARE phase timed out.
    EventTimeoutPrepare,
    /// Timer: the ACCEPT phase timed out.
    EventTimeoutAccept,
}

impl MessageKind {
    const ALL: [MessageKind; 12] = [
        MessageKind::Prepare,
        MessageKind::PrepareAck,
        MessageKind::PrepareNack,
        MessageKind::Accept,
        MessageKind::AcceptAck,
        MessageKind::AcceptNack,
        MessageKind::Learn,
        MessageKind::WrongView,
        MessageKind::EventRestart,
        MessageKind::EventRenew,
        MessageKind::EventTimeoutPrepare,
        MessageKind::EventTimeoutAccept,
    ];

    /// Wire ordinal of this kind.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Looks up a kind by its wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Timer events generated locally by the proposer.
    pub fn is_internal_event(self) -> bool {
        matches!(
            self,
            MessageKind::EventRestart
                | MessageKind::EventRenew
                | MessageKind::EventTimeoutPrepare
                | MessageKind::EventTimeoutAccept
        )
    }

    /// Requests handled by an acceptor.
    pub fn is_acceptor_message(self) -> bool {
        matches!(
            self,
            MessageKind::Prepare | MessageKind::Accept | MessageKind::Learn
        )
    }

    /// Responses handled by a proposer.
    pub fn is_proposer_message(self) -> bool {
        matches!(
            self,
            MessageKind::PrepareAck
                | MessageKind::PrepareNack
                | MessageKind::AcceptAck
                | MessageKind::AcceptNack
                | MessageKind::WrongView
        )
    }
}

/// A Flease protocol message or timer event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleaseMessage {
    /// Message kind.
    pub kind: MessageKind,
    /// Cell this message is about.
    pub cell_id: CellId,
    /// Ballot of the round this message belongs to.
    pub proposal_no: ProposalNumber,
    /// Previously accepted (ACK) or competing (NACK) ballot.
    pub prev_proposal_no: ProposalNumber,
    /// Proposed or accepted lease holder.
    pub lease_holder: Option<String>,
    /// Absolute lease timeout in global time (ms).
    pub lease_timeout_ms: i64,
    /// Global time at which the message was sent (ms).
    pub send_timestamp_ms: i64,
    /// View id of the sender.
    pub view_id: i32,
    /// Master epoch requested, returned or committed.
    pub master_epoch: i64,
    /// Transport address of the sender, set on receipt.
    pub sender: Option<SocketAddr>,
}

impl FleaseMessage {
    /// Creates an empty message of the given kind for a cell.
    pub fn new(kind: MessageKind, cell_id: CellId) -> Self {
        FleaseMessage {
            kind,
            cell_id,
            proposal_no: ProposalNumber::EMPTY,
            prev_proposal_no: ProposalNumber::EMPTY,
            lease_holder: None,
            lease_timeout_ms: 0,
            send_timestamp_ms: 0,
            view_id: 0,
            master_epoch: IGNORE_MASTER_EPOCH,
            sender: None,
        }
    }

    /// Creates a timer event for a cell tagged with a ballot.
    pub fn event(kind: MessageKind, cell_id: CellId, ballot: ProposalNumber) -> Self {
        let mut msg = FleaseMessage::new(kind, cell_id);
        msg.proposal_no = ballot;
        msg
    }

    /// Creates a reply of the given kind that copies the request's round state.
    ///
    /// The send timestamp and the sender are not copied.
    pub fn reply(&self, kind: MessageKind) -> Self {
        FleaseMessage {
            kind,
            cell_id: self.cell_id.clone(),
            proposal_no: self.proposal_no,
            prev_proposal_no: self.prev_proposal_no,
            lease_holder: self.lease_holder.clone(),
            lease_timeout_ms: self.lease_timeout_ms,
            send_timestamp_ms: 0,
            view_id: self.view_id,
            master_epoch: self.master_epoch,
            sender: None,
        }
    }

    /// True if this message's ballot is before `other`'s.
    pub fn before(&self, other: &FleaseMessage) -> bool {
        self.proposal_no.before(&other.proposal_no)
    }

    /// True if this message's ballot is after `other`'s.
    pub fn after(&self, other: &FleaseMessage) -> bool {
        self.proposal_no.after(&other.proposal_no)
    }

    /// True once the lease is definitely expired, even with maximal clock skew.
    pub fn has_timed_out(&self, config: &FleaseConfig, now_ms: i64) -> bool {
        self.lease_timeout_ms.saturating_add(config.d_max_ms) < now_ms
    }

    /// True while the lease is definitely valid, even with maximal clock skew.
    pub fn has_not_timed_out(&self, config: &FleaseConfig, now_ms: i64) -> bool {
        self.lease_timeout_ms.saturating_sub(config.d_max_ms) > now_ms
    }

    /// Appends the wire encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.ordinal());
        put_bytes(buf, self.cell_id.as_bytes());
        buf.put_i64(self.proposal_no.sequence());
        buf.put_i32(self.proposal_no.sender_id());
        buf.put_i64(self.prev_proposal_no.sequence());
        buf.put_i32(self.prev_proposal_no.sender_id());
        buf.put_i64(self.send_timestamp_ms);
        buf.put_i64(self.lease_timeout_ms);
        match &self.lease_holder {
            Some(holder) => put_bytes(buf, holder.as_bytes()),
            None => buf.put_u32(0),
        }
        buf.put_i32(self.view_id);
        buf.put_i64(self.master_epoch);
    }

    /// Encodes this message into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Size of the wire encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 4
            + self.cell_id.as_bytes().len()
            + 2 * (8 + 4)
            + 8
            + 8
            + 4
            + self.lease_holder.as_ref().map_or(0, |h| h.len())
            + 4
            + 8
    }

    /// Decodes a message. The sender is left unset.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let ordinal = get_u8(&mut buf)?;
        let kind = MessageKind::from_ordinal(ordinal)
            .ok_or_else(|| FleaseError::Codec(format!("unknown message kind {}", ordinal)))?;
        let cell_id = CellId::new(get_bytes(&mut buf)?);
        let proposal_no = ProposalNumber::new(get_i64(&mut buf)?, get_i32(&mut buf)?);
        let prev_proposal_no = ProposalNumber::new(get_i64(&mut buf)?, get_i32(&mut buf)?);
        let send_timestamp_ms = get_i64(&mut buf)?;
        let lease_timeout_ms = get_i64(&mut buf)?;
        let holder = get_bytes(&mut buf)?;
        let lease_holder = if holder.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(holder)
                    .map_err(|e| FleaseError::Codec(format!("lease holder: {}", e)))?,
            )
        };
        let view_id = get_i32(&mut buf)?;
        let master_epoch = get_i64(&mut buf)?;
        Ok(FleaseMessage {
            kind,
            cell_id,
            proposal_no,
            prev_proposal_no,
            lease_holder,
            lease_timeout_ms,
            send_timestamp_ms,
            view_id,
            master_epoch,
            sender: None,
        })
    }
}

impl fmt::Display for FleaseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} cell={} ballot={} prev={} holder={} timeout={} ts={} view={} epoch={}",
            self.kind,
            self.cell_id,
            self.proposal_no,
            self.prev_proposal_no,
            self.lease_holder.as_deref().unwrap_or("-"),
            self.lease_timeout_ms,
            self.send_timestamp_ms,
            self.view_id,
            self.master_epoch
        )
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(FleaseError::Codec(format!(
            "truncated message: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

/// An observable lease: who holds a cell until when, under which epoch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flease {
    /// Cell the lease is for.
    pub cell_id: CellId,
    /// Current holder, `None` if unknown or free.
    pub holder: Option<String>,
    /// Absolute timeout in global time (ms).
    pub lease_timeout_ms: i64,
    /// Master epoch of the holder.
    pub master_epoch: i64,
}

impl Flease {
    /// Creates a lease value.
    pub fn new(
        cell_id: CellId,
        holder: Option<String>,
        lease_timeout_ms: i64,
        master_epoch: i64,
    ) -> Self {
        Flease {
            cell_id,
            holder,
            lease_timeout_ms,
            master_epoch,
        }
    }

    /// The "no lease" value for a cell.
    pub fn empty(cell_id: CellId) -> Self {
        Flease::new(cell_id, None, 0, IGNORE_MASTER_EPOCH)
    }

    /// True for the empty lease.
    pub fn is_empty(&self) -> bool {
        self.holder.is_none() && self.lease_timeout_ms == 0
    }

    /// Valid at `now_ms`: there is a holder and `now_ms < timeout`.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.holder.is_some() && now_ms < self.lease_timeout_ms
    }

    /// In the clock-skew window right after the nominal timeout.
    pub fn is_in_grace_period(&self, now_ms: i64, d_max_ms: i64) -> bool {
        self.holder.is_some()
            && self.lease_timeout_ms <= now_ms
            && now_ms < self.lease_timeout_ms.saturating_add(d_max_ms)
    }

    /// True if both leases name the same holder.
    pub fn is_same_holder(&self, other: &Flease) -> bool {
        self.holder == other.holder
    }
}

impl fmt::Display for Flease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} until {} (epoch {})",
            self.cell_id,
            self.holder.as_deref().unwrap_or("<none>"),
            self.lease_timeout_ms,
            self.master_epoch
        )
    }
}
