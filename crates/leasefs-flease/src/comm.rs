//! Collaborator interfaces of the Flease core.
//!
//! The proposer and acceptor never touch sockets or clocks directly. They emit
//! messages and timer requests through [`FleaseComm`], report outcomes through
//! [`FleaseListener`], and read time from a [`Clock`]. [`Outbox`] implements
//! both traits by recording [`Effect`]s, which the stage (or a test harness)
//! applies after each dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::error::FleaseError;
use crate::types::{CellId, Flease, FleaseMessage};

/// Outgoing side of the protocol: fire-and-forget sends and single-shot timers.
pub trait FleaseComm {
    /// Sends `message` to the acceptor or proposer at `receiver`. Best effort.
    fn send_message(&mut self, message: FleaseMessage, receiver: SocketAddr);

    /// Re-delivers `message` to the proposer at `timestamp_ms`.
    fn request_timer(&mut self, message: FleaseMessage, timestamp_ms: i64);
}

/// Notifications raised by the proposer and acceptor.
pub trait FleaseListener {
    /// A valid lease became known, or `holder = None` while it is indeterminate.
    fn learned_event(
        &mut self,
        cell_id: &CellId,
        holder: Option<&str>,
        lease_timeout_ms: i64,
        master_epoch: i64,
    );

    /// A cell exhausted its retry budget.
    fn lease_failed(&mut self, cell_id: &CellId, error: FleaseError);

    /// A peer reported a view different from the local one.
    fn view_id_change_event(&mut self, cell_id: &CellId, view_id: i32, on_proposal: bool);
}

/// Both halves of the proposer's environment in one object.
pub trait FleaseSink: FleaseComm + FleaseListener {}

impl<T: FleaseComm + FleaseListener> FleaseSink for T {}

/// One recorded side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a message to a peer.
    Send {
        /// Message to send.
        message: FleaseMessage,
        /// Destination.
        to: SocketAddr,
    },
    /// Schedule a timer event.
    Timer {
        /// Event to deliver.
        message: FleaseMessage,
        /// Absolute delivery time (ms).
        at_ms: i64,
    },
    /// A lease was learned.
    Learned(Flease),
    /// A cell gave up after too many failures.
    LeaseFailed {
        /// Failed cell.
        cell_id: CellId,
        /// Cause with cell trace.
        error: FleaseError,
    },
    /// A different view was observed.
    ViewChange {
        /// Affected cell.
        cell_id: CellId,
        /// Observed view id.
        view_id: i32,
        /// True if observed by the proposer, false if by the acceptor.
        on_proposal: bool,
    },
}

/// Records effects in emission order.
#[derive(Debug, Default)]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Effects recorded so far.
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Removes and returns all recorded effects.
    pub fn take(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Messages sent so far, with their destinations.
    pub fn sent(&self) -> impl Iterator<Item = (&FleaseMessage, SocketAddr)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Send { message, to } => Some((message, *to)),
            _ => None,
        })
    }

    /// Timers requested so far.
    pub fn timers(&self) -> impl Iterator<Item = (&FleaseMessage, i64)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Timer { message, at_ms } => Some((message, *at_ms)),
            _ => None,
        })
    }
}

impl FleaseComm for Outbox {
    fn send_message(&mut self, message: FleaseMessage, receiver: SocketAddr) {
        self.effects.push(Effect::Send {
            message,
            to: receiver,
        });
    }

    fn request_timer(&mut self, message: FleaseMessage, timestamp_ms: i64) {
        self.effects.push(Effect::Timer {
            message,
            at_ms: timestamp_ms,
        });
    }
}

impl FleaseListener for Outbox {
    fn learned_event(
        &mut self,
        cell_id: &CellId,
        holder: Option<&str>,
        lease_timeout_ms: i64,
        master_epoch: i64,
    ) {
        self.effects.push(Effect::Learned(Flease::new(
            cell_id.clone(),
            holder.map(str::to_string),
            lease_timeout_ms,
            master_epoch,
        )));
    }

    fn lease_failed(&mut self, cell_id: &CellId, error: FleaseError) {
        self.effects.push(Effect::LeaseFailed {
            cell_id: cell_id.clone(),
            error,
        });
    }

    fn view_id_change_event(&mut self, cell_id: &CellId, view_id: i32, on_proposal: bool) {
        self.effects.push(Effect::ViewChange {
            cell_id: cell_id.clone(),
            view_id,
            on_proposal,
        });
    }
}

/// Where a message resumes once a master epoch operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Feed the response to the local proposer.
    ProposerResponse,
    /// Send the acceptor's reply to the requesting proposer.
    AcceptorReply {
        /// Proposer address.
        to: SocketAddr,
    },
}

/// A message waiting at a pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumption {
    /// Stage to continue at.
    pub stage: PipelineStage,
    /// Message to continue with.
    pub message: FleaseMessage,
}

/// Handed to a [`MasterEpochHandler`]; finishing it resumes the pipeline.
#[derive(Debug)]
pub struct EpochCompletion {
    resumption: Resumption,
    sink: mpsc::UnboundedSender<Resumption>,
}

impl EpochCompletion {
    /// Message being processed.
    pub fn message(&self) -> &FleaseMessage {
        &self.resumption.message
    }

    /// Mutable access, used to fill in the current master epoch.
    pub fn message_mut(&mut self) -> &mut FleaseMessage {
        &mut self.resumption.message
    }

    /// Marks the epoch as durable and re-queues the message at its next stage.
    pub fn finish(self) {
        if self.sink.send(self.resumption).is_err() {
            tracing::debug!("stage stopped, dropping master epoch continuation");
        }
    }
}

/// External fencing store for master epochs.
pub trait MasterEpochHandler: Send {
    /// Sets the stored epoch on the PREPARE_ACK in `completion`, then finishes it.
    fn send_master_epoch(&mut self, completion: EpochCompletion);

    /// Durably records the ACCEPT's epoch, then finishes `completion`.
    fn store_master_epoch(&mut self, completion: EpochCompletion);
}

/// A master epoch handler plus the queue its completions resume on.
pub struct EpochPipeline {
    handler: Box<dyn MasterEpochHandler>,
    sink: mpsc::UnboundedSender<Resumption>,
}

impl EpochPipeline {
    /// Wraps `handler`; completions are delivered to `sink`.
    pub fn new(
        handler: Box<dyn MasterEpochHandler>,
        sink: mpsc::UnboundedSender<Resumption>,
    ) -> Self {
        Self { handler, sink }
    }

    /// Routes a PREPARE_ACK through the handler's `send_master_epoch`.
    pub fn send_master_epoch(&mut self, message: FleaseMessage, stage: PipelineStage) {
        let completion = self.completion(message, stage);
        self.handler.send_master_epoch(completion);
    }

    /// Routes an ACCEPT_ACK through the handler's `store_master_epoch`.
    pub fn store_master_epoch(&mut self, message: FleaseMessage, stage: PipelineStage) {
        let completion = self.completion(message, stage);
        self.handler.store_master_epoch(completion);
    }

    fn completion(&self, message: FleaseMessage, stage: PipelineStage) -> EpochCompletion {
        EpochCompletion {
            resumption: Resumption { stage, message },
            sink: self.sink.clone(),
        }
    }
}

/// Source of global time in milliseconds.
pub trait Clock: Send + Sync {
    /// Current global time (ms since the epoch).
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock showing `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, ProposalNumber};

    struct FixedEpoch(i64);

    impl MasterEpochHandler for FixedEpoch {
        fn send_master_epoch(&mut self, mut completion: EpochCompletion) {
            completion.message_mut().master_epoch = self.0;
            completion.finish();
        }

        fn store_master_epoch(&mut self, completion: EpochCompletion) {
            self.0 = completion.message().master_epoch;
            completion.finish();
        }
    }

    #[test]
    fn test_outbox_records_in_order() {
        let mut outbox = Outbox::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cell = CellId::from("c");
        outbox.send_message(FleaseMessage::new(MessageKind::Prepare, cell.clone()), addr);
        outbox.request_timer(
            FleaseMessage::event(MessageKind::EventRestart, cell.clone(), ProposalNumber::EMPTY),
            77,
        );
        outbox.learned_event(&cell, Some("a"), 5, 1);
        assert_eq!(outbox.sent().count(), 1);
        assert_eq!(outbox.timers().next().map(|(_, at)| at), Some(77));
        assert!(matches!(outbox.effects()[2], Effect::Learned(_)));
        assert_eq!(outbox.take().len(), 3);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_epoch_pipeline_resumes_with_filled_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = EpochPipeline::new(Box::new(FixedEpoch(9)), tx);
        let ack = FleaseMessage::new(MessageKind::PrepareAck, CellId::from("c"));
        pipeline.send_master_epoch(ack, PipelineStage::ProposerResponse);
        let resumed = rx.try_recv().unwrap();
        assert_eq!(resumed.stage, PipelineStage::ProposerResponse);
        assert_eq!(resumed.message.master_epoch, 9);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
    }
}
