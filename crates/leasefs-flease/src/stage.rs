//! The single logical driver of a Flease node.
//!
//! [`StageCore`] owns the proposer, the acceptor, the timer queue and the
//! lease timeout queue, and applies the effects they emit. It is synchronous
//! and takes the current time as an argument, so tests can drive it step by
//! step. [`FleaseStage`] runs a core on one tokio task and feeds it from an
//! unbounded queue; [`FleaseStageHandle`] is the cloneable front door.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::acceptor::FleaseAcceptor;
use crate::comm::{
    Clock, Effect, EpochPipeline, MasterEpochHandler, Outbox, PipelineStage, Resumption,
    SystemClock,
};
use crate::config::FleaseConfig;
use crate::error::{FleaseError, Result};
use crate::proposer::{Env, FleaseProposer};
use crate::types::{
    CellId, Flease, FleaseMessage, MessageKind, IGNORE_MASTER_EPOCH, REQUEST_MASTER_EPOCH,
    VIEW_ID_INVALIDATED,
};

/// Period of the timer and lease timeout checks (ms).
pub const TIMER_INTERVAL_MS: i64 = 50;

/// Transport used by the stage to reach remote acceptors and proposers.
pub trait FleaseMessageSender: Send {
    /// Sends `message` to `receiver`. Best effort, must not block.
    fn send_message(&mut self, message: FleaseMessage, receiver: SocketAddr);
}

/// Receives lease state changes for open cells.
pub trait FleaseStatusListener: Send {
    /// The lease of `cell_id` changed. An empty lease means none is known.
    fn status_changed(&mut self, cell_id: &CellId, lease: &Flease);

    /// Acquisition failed `max_retries` times in a row.
    fn lease_failed(&mut self, cell_id: &CellId, error: &FleaseError);
}

/// Receives views reported by peers.
pub trait FleaseViewChangeListener: Send {
    /// A peer reported `view_id` for `cell_id`.
    fn view_id_change_event(&mut self, cell_id: &CellId, view_id: i32, on_proposal: bool);
}

/// View listener that only logs.
#[derive(Debug, Default)]
pub struct LoggingViewListener;

impl FleaseViewChangeListener for LoggingViewListener {
    fn view_id_change_event(&mut self, cell_id: &CellId, view_id: i32, on_proposal: bool) {
        tracing::info!(cell = %cell_id, view_id, on_proposal, "peer reported a different view");
    }
}

#[derive(Debug)]
struct TimerEntry {
    at_ms: i64,
    seq: u64,
    message: FleaseMessage,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at_ms
            .cmp(&other.at_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Collaborators and options for a stage.
pub struct StageBuilder {
    config: FleaseConfig,
    sender: Box<dyn FleaseMessageSender>,
    status: Box<dyn FleaseStatusListener>,
    views: Box<dyn FleaseViewChangeListener>,
    epoch_handler: Option<Box<dyn MasterEpochHandler>>,
    lock_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl StageBuilder {
    /// Starts a builder with the mandatory collaborators.
    pub fn new(
        config: FleaseConfig,
        sender: Box<dyn FleaseMessageSender>,
        status: Box<dyn FleaseStatusListener>,
    ) -> Self {
        Self {
            config,
            sender,
            status,
            views: Box::new(LoggingViewListener),
            epoch_handler: None,
            lock_dir: None,
            clock: Arc::new(SystemClock),
            rng: None,
        }
    }

    /// Listener for views reported by peers.
    pub fn view_listener(mut self, views: Box<dyn FleaseViewChangeListener>) -> Self {
        self.views = views;
        self
    }

    /// Handler for master epoch requests and commits.
    pub fn epoch_handler(mut self, handler: Box<dyn MasterEpochHandler>) -> Self {
        self.epoch_handler = Some(handler);
        self
    }

    /// Directory for the acceptor's restart lock file.
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Random source for ballot and retry jitter. Defaults to OS entropy.
    pub fn rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Builds a core plus the queue its master epoch continuations arrive on.
    pub fn build_core(self) -> Result<(StageCore, mpsc::UnboundedReceiver<Resumption>)> {
        let now = self.clock.now_ms();
        let acceptor = match &self.lock_dir {
            Some(dir) => FleaseAcceptor::with_lock_dir(self.config.clone(), dir, now)?,
            None => FleaseAcceptor::new(self.config.clone()),
        };
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let epochs = self
            .epoch_handler
            .map(|handler| EpochPipeline::new(handler, resume_tx));
        let rng: Box<dyn RngCore + Send> = match self.rng {
            Some(rng) => rng,
            None => Box::new(StdRng::from_entropy()),
        };
        let core = StageCore {
            proposer: FleaseProposer::new(self.config.clone()),
            acceptor,
            config: self.config,
            epochs,
            rng,
            sender: self.sender,
            status: self.status,
            views: self.views,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            lease_timeouts: BinaryHeap::new(),
            tracked: HashMap::new(),
        };
        Ok((core, resume_rx))
    }

    /// Builds the stage and spawns it on the current tokio runtime.
    pub fn spawn(self) -> Result<(FleaseStageHandle, JoinHandle<()>)> {
        let clock = Arc::clone(&self.clock);
        let identity = self.config.identity.clone();
        let (core, resumptions) = self.build_core()?;
        let (tx, inputs) = mpsc::unbounded_channel();
        let stage = FleaseStage {
            core,
            clock,
            inputs,
            resumptions,
        };
        let join = tokio::spawn(stage.run());
        Ok((FleaseStageHandle { tx, identity }, join))
    }
}

/// Proposer, acceptor and queues of one node, driven by explicit calls.
pub struct StageCore {
    config: FleaseConfig,
    proposer: FleaseProposer,
    acceptor: FleaseAcceptor,
    epochs: Option<EpochPipeline>,
    rng: Box<dyn RngCore + Send>,
    sender: Box<dyn FleaseMessageSender>,
    status: Box<dyn FleaseStatusListener>,
    views: Box<dyn FleaseViewChangeListener>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    lease_timeouts: BinaryHeap<Reverse<(i64, CellId)>>,
    tracked: HashMap<CellId, Flease>,
}

impl StageCore {
    /// Node identity.
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Read access to the proposer.
    pub fn proposer(&self) -> &FleaseProposer {
        &self.proposer
    }

    /// Earliest scheduled timer, if any.
    pub fn next_timer_at(&self) -> Option<i64> {
        self.timers.peek().map(|Reverse(e)| e.at_ms)
    }

    /// Number of scheduled timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn with_proposer<T>(
        &mut self,
        now_ms: i64,
        f: impl FnOnce(&mut FleaseProposer, &mut Env<'_>) -> T,
    ) -> T {
        let mut outbox = Outbox::new();
        let result = {
            let mut env = Env {
                now_ms,
                acceptor: &mut self.acceptor,
                sink: &mut outbox,
                epochs: self.epochs.as_mut(),
                rng: &mut *self.rng,
            };
            f(&mut self.proposer, &mut env)
        };
        self.apply(outbox.take(), now_ms);
        result
    }

    fn apply(&mut self, effects: Vec<Effect>, now_ms: i64) {
        for effect in effects {
            match effect {
                Effect::Send { message, to } => self.sender.send_message(message, to),
                Effect::Timer { message, at_ms } => self.create_timer(message, at_ms),
                Effect::Learned(lease) => self.learned_event(lease, now_ms),
                Effect::LeaseFailed { cell_id, error } => {
                    self.status.lease_failed(&cell_id, &error)
                }
                Effect::ViewChange {
                    cell_id,
                    view_id,
                    on_proposal,
                } => self.views.view_id_change_event(&cell_id, view_id, on_proposal),
            }
        }
    }

    fn create_timer(&mut self, message: FleaseMessage, at_ms: i64) {
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            at_ms,
            seq: self.timer_seq,
            message,
        }));
    }

    fn learned_event(&mut self, lease: Flease, now_ms: i64) {
        tracing::debug!(cell = %lease.cell_id, holder = ?lease.holder, timeout = lease.lease_timeout_ms, "learned event");
        let Some(old) = self
            .proposer
            .update_prev_lease_for_cell(&lease.cell_id, lease.clone())
        else {
            return;
        };
        if old.is_valid(now_ms) && !old.is_same_holder(&lease) {
            tracing::error!(
                cell = %lease.cell_id,
                new = %lease,
                old = %old,
                "new lease replaced old lease which is still valid according to local clock, check clock synchronization"
            );
        }
        tracing::debug!(cell = %lease.cell_id, holder = ?lease.holder, timeout = lease.lease_timeout_ms, "lease state change");
        self.status.status_changed(&lease.cell_id, &lease);
        if lease.is_empty() {
            self.tracked.remove(&lease.cell_id);
        } else if self.config.enable_timeout_events {
            self.lease_timeouts
                .push(Reverse((lease.lease_timeout_ms, lease.cell_id.clone())));
            self.tracked.insert(lease.cell_id.clone(), lease);
        }
    }

    /// Dispatches a message received from the network.
    pub fn handle_message(&mut self, msg: FleaseMessage, now_ms: i64) {
        if self.config.debug_print_messages {
            tracing::trace!(msg = %msg, sender = ?msg.sender, "stage received message");
        }
        if msg.kind.is_internal_event() {
            tracing::warn!(cell = %msg.cell_id, kind = ?msg.kind, "received internal event from network, dropped");
            return;
        }
        if !msg.kind.is_acceptor_message() {
            self.with_proposer(now_ms, |p, env| p.process_message(msg, env));
            return;
        }

        let mut outbox = Outbox::new();
        let response = self.acceptor.process_message(&msg, now_ms, &mut outbox);
        self.apply(outbox.take(), now_ms);
        let Some(response) = response else {
            return;
        };
        let Some(to) = msg.sender else {
            tracing::warn!(cell = %msg.cell_id, kind = ?msg.kind, "acceptor message without sender, reply dropped");
            return;
        };

        let stage = PipelineStage::AcceptorReply { to };
        if msg.master_epoch == REQUEST_MASTER_EPOCH && response.kind == MessageKind::PrepareAck {
            match self.epochs.as_mut() {
                Some(epochs) => epochs.send_master_epoch(response, stage),
                None => {
                    tracing::error!(cell = %msg.cell_id, "master epoch requested but no master epoch handler configured");
                    self.sender.send_message(response, to);
                }
            }
        } else if msg.master_epoch != IGNORE_MASTER_EPOCH && response.kind == MessageKind::AcceptAck
        {
            match self.epochs.as_mut() {
                Some(epochs) => epochs.store_master_epoch(response, stage),
                None => self.sender.send_message(response, to),
            }
        } else {
            self.sender.send_message(response, to);
        }
    }

    /// Continues a message after its master epoch step completed.
    pub fn resume(&mut self, resumption: Resumption, now_ms: i64) {
        let Resumption { stage, message } = resumption;
        match stage {
            PipelineStage::ProposerResponse => {
                self.with_proposer(now_ms, |p, env| p.process_message(message, env))
            }
            PipelineStage::AcceptorReply { to } => self.sender.send_message(message, to),
        }
    }

    /// Opens a cell and tries to acquire its lease. Failures are also reported
    /// to the status listener.
    pub fn open_cell(
        &mut self,
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
        now_ms: i64,
    ) -> Result<()> {
        let result = self.with_proposer(now_ms, |p, env| {
            p.open_cell(cell_id.clone(), acceptors, request_master_epoch, view_id, env)
        });
        match result {
            Ok(()) => {
                self.acceptor.set_view_id(&cell_id, view_id, now_ms);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(cell = %cell_id, error = %e, "open cell failed");
                self.status.lease_failed(&cell_id, &e);
                Err(e)
            }
        }
    }

    /// Closes a cell. The lease, if held, is not renewed any more.
    pub fn close_cell(&mut self, cell_id: &CellId) -> bool {
        self.tracked.remove(cell_id);
        self.proposer.close_cell(cell_id)
    }

    /// Hands the lease of `cell_id` over to `new_owner`.
    ///
    /// Once the handover passes its checks the proposer reports the holder as
    /// unknown, which clears the previous lease and its timeout notification
    /// and reaches the status listener as an empty lease.
    pub fn handover_lease(
        &mut self,
        cell_id: &CellId,
        new_owner: String,
        now_ms: i64,
    ) -> Result<()> {
        self.with_proposer(now_ms, |p, env| p.handover_lease(cell_id, new_owner, env))
    }

    /// Sets the view of a cell on both the proposer and the acceptor.
    pub fn set_view_id(&mut self, cell_id: &CellId, view_id: i32, now_ms: i64) {
        if view_id != VIEW_ID_INVALIDATED {
            self.proposer.set_view_id(cell_id, view_id);
        }
        self.acceptor.set_view_id(cell_id, view_id, now_ms);
    }

    /// Learned value of every cell the acceptor knows.
    pub fn local_state(&self) -> HashMap<CellId, Option<FleaseMessage>> {
        self.acceptor.local_state()
    }

    /// Fires due timers and lease timeout notifications.
    pub fn on_tick(&mut self, now_ms: i64) {
        self.check_timers(now_ms);
        if self.config.enable_timeout_events {
            self.check_lease_timeouts(now_ms);
        }
    }

    fn check_timers(&mut self, now_ms: i64) {
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(e)| e.at_ms <= now_ms + TIMER_INTERVAL_MS)
        {
            let Some(Reverse(entry)) = self.timers.pop() else {
                break;
            };
            if entry.at_ms < now_ms {
                tracing::debug!(msg = %entry.message, late_ms = now_ms - entry.at_ms, "event sent after deadline");
            }
            let mut message = entry.message;
            message.send_timestamp_ms = now_ms;
            self.with_proposer(now_ms, |p, env| p.process_message(message, env));
        }
    }

    fn check_lease_timeouts(&mut self, now_ms: i64) {
        let deadline = now_ms + TIMER_INTERVAL_MS + self.config.to_notification_ms;
        while self
            .lease_timeouts
            .peek()
            .is_some_and(|Reverse((timeout, _))| *timeout <= deadline)
        {
            let Some(Reverse((timeout, cell_id))) = self.lease_timeouts.pop() else {
                break;
            };
            // Entries superseded by a newer lease are skipped.
            if self.tracked.get(&cell_id).map(|l| l.lease_timeout_ms) != Some(timeout) {
                continue;
            }
            self.tracked.remove(&cell_id);
            tracing::debug!(cell = %cell_id, timeout, "lease timed out");

            let empty = Flease::empty(cell_id.clone());
            self.proposer
                .update_prev_lease_for_cell(&cell_id, empty.clone());
            self.status.status_changed(&cell_id, &empty);

            let mut restart = FleaseMessage::event(
                MessageKind::EventRestart,
                cell_id.clone(),
                self.proposer.current_ballot(&cell_id),
            );
            restart.view_id = self
                .proposer
                .cell(&cell_id)
                .map_or(0, |c| c.view_id());
            self.create_timer(restart, now_ms + self.config.d_max_ms);
        }
    }

    /// Releases the acceptor's lock file.
    pub fn shutdown(&mut self) {
        self.acceptor.shutdown();
    }
}

/// Requests served by the stage task.
#[derive(Debug)]
pub enum StageRequest {
    /// Open a cell and acquire its lease.
    OpenCell {
        /// Cell to open.
        cell_id: CellId,
        /// Remote acceptors, excluding this node.
        acceptors: Vec<SocketAddr>,
        /// Request a master epoch on acquisition.
        request_master_epoch: bool,
        /// Initial view.
        view_id: i32,
        /// Completion.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Close a cell.
    CloseCell {
        /// Cell to close.
        cell_id: CellId,
        /// True if the cell was open.
        reply: oneshot::Sender<bool>,
    },
    /// Hand the lease over to another node.
    HandoverLease {
        /// Cell whose lease is handed over.
        cell_id: CellId,
        /// Identity of the new holder.
        new_owner: String,
        /// Completion; fails if the preconditions do not hold.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Set the view of a cell.
    SetView {
        /// Cell to update.
        cell_id: CellId,
        /// New view, or [`VIEW_ID_INVALIDATED`].
        view_id: i32,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Snapshot the acceptor's learned values.
    GetState {
        /// Learned value per cell.
        reply: oneshot::Sender<HashMap<CellId, Option<FleaseMessage>>>,
    },
}

/// Input queue entries of the stage task.
#[derive(Debug)]
pub enum StageInput {
    /// A message from the network.
    Message(FleaseMessage),
    /// A local request.
    Request(StageRequest),
    /// Stop the task.
    Shutdown,
}

/// A [`StageCore`] running on its own tokio task.
pub struct FleaseStage {
    core: StageCore,
    clock: Arc<dyn Clock>,
    inputs: mpsc::UnboundedReceiver<StageInput>,
    resumptions: mpsc::UnboundedReceiver<Resumption>,
}

impl FleaseStage {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(TIMER_INTERVAL_MS as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(identity = %self.core.identity(), "flease stage ready");

        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(StageInput::Message(msg)) => {
                        let now = self.clock.now_ms();
                        self.core.handle_message(msg, now);
                    }
                    Some(StageInput::Request(request)) => self.handle_request(request),
                    Some(StageInput::Shutdown) | None => break,
                },
                Some(resumption) = self.resumptions.recv() => {
                    let now = self.clock.now_ms();
                    self.core.resume(resumption, now);
                }
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    self.core.on_tick(now);
                }
            }
        }

        self.core.shutdown();
        tracing::info!(identity = %self.core.identity(), "flease stage stopped");
    }

    fn handle_request(&mut self, request: StageRequest) {
        let now = self.clock.now_ms();
        match request {
            StageRequest::OpenCell {
                cell_id,
                acceptors,
                request_master_epoch,
                view_id,
                reply,
            } => {
                let result =
                    self.core
                        .open_cell(cell_id, acceptors, request_master_epoch, view_id, now);
                let _ = reply.send(result);
            }
            StageRequest::CloseCell { cell_id, reply } => {
                let _ = reply.send(self.core.close_cell(&cell_id));
            }
            StageRequest::HandoverLease {
                cell_id,
                new_owner,
                reply,
            } => {
                let _ = reply.send(self.core.handover_lease(&cell_id, new_owner, now));
            }
            StageRequest::SetView {
                cell_id,
                view_id,
                reply,
            } => {
                self.core.set_view_id(&cell_id, view_id, now);
                let _ = reply.send(());
            }
            StageRequest::GetState { reply } => {
                let _ = reply.send(self.core.local_state());
            }
        }
    }
}

/// Cloneable handle to a running [`FleaseStage`].
#[derive(Debug, Clone)]
pub struct FleaseStageHandle {
    tx: mpsc::UnboundedSender<StageInput>,
    identity: String,
}

impl FleaseStageHandle {
    /// Identity of the node.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queues a message received from the network. Its sender must be set.
    pub fn receive_message(&self, msg: FleaseMessage) -> Result<()> {
        self.tx
            .send(StageInput::Message(msg))
            .map_err(|_| FleaseError::StageStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StageRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StageInput::Request(build(reply)))
            .map_err(|_| FleaseError::StageStopped)?;
        rx.await.map_err(|_| FleaseError::StageStopped)
    }

    /// Opens a cell. The lease outcome arrives at the status listener.
    pub async fn open_cell(
        &self,
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
    ) -> Result<()> {
        self.request(|reply| StageRequest::OpenCell {
            cell_id,
            acceptors,
            request_master_epoch,
            view_id,
            reply,
        })
        .await?
    }

    /// Closes a cell. Returns false if it was not open.
    pub async fn close_cell(&self, cell_id: CellId) -> Result<bool> {
        self.request(|reply| StageRequest::CloseCell { cell_id, reply })
            .await
    }

    /// Hands a lease this node holds over to `new_owner`.
    pub async fn handover_lease(&self, cell_id: CellId, new_owner: String) -> Result<()> {
        self.request(|reply| StageRequest::HandoverLease {
            cell_id,
            new_owner,
            reply,
        })
        .await?
    }

    /// Sets the view of a cell.
    pub async fn set_view_id(&self, cell_id: CellId, view_id: i32) -> Result<()> {
        self.request(|reply| StageRequest::SetView {
            cell_id,
            view_id,
            reply,
        })
        .await
    }

    /// Learned value per cell, as seen by the local acceptor.
    pub async fn local_state(&self) -> Result<HashMap<CellId, Option<FleaseMessage>>> {
        self.request(|reply| StageRequest::GetState { reply }).await
    }

    /// Asks the stage to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StageInput::Shutdown);
    }
}
