//! Flease proposer state machine.
//!
//! Drives prepare/accept/learn rounds to acquire, renew and hand over leases.
//! The proposer is sans-IO: every entry point receives an [`Env`] carrying the
//! current time, the local acceptor, the effect sink, the optional master epoch
//! pipeline and the random source. Callers serialize all calls for a proposer
//! (the stage runs them on one task).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use rand::{Rng, RngCore};

use crate::acceptor::FleaseAcceptor;
use crate::comm::{EpochPipeline, FleaseSink, PipelineStage};
use crate::config::FleaseConfig;
use crate::error::{FleaseError, Result};
use crate::types::{
    CellId, Flease, FleaseMessage, MessageKind, ProposalNumber, IGNORE_MASTER_EPOCH,
    REQUEST_MASTER_EPOCH, VIEW_ID_INVALIDATED,
};

/// Actions kept per cell for the failure trace.
const MAX_CELL_ACTIONS: usize = 32;

/// Everything a proposer call may touch besides the proposer itself.
pub struct Env<'a> {
    /// Current global time (ms).
    pub now_ms: i64,
    /// This node's acceptor.
    pub acceptor: &'a mut FleaseAcceptor,
    /// Outgoing messages, timers and notifications.
    pub sink: &'a mut dyn FleaseSink,
    /// Master epoch handling, if configured.
    pub epochs: Option<&'a mut EpochPipeline>,
    /// Random source for ballot and retry jitter.
    pub rng: &'a mut dyn RngCore,
}

/// Phase of a proposer cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellState {
    /// No round in progress.
    Idle,
    /// PREPARE sent, collecting promises.
    WaitForPrepAck,
    /// ACCEPT sent, collecting acceptances.
    WaitForAcceptAck,
}

/// Proposer-side state of one cell.
#[derive(Debug)]
pub struct ProposerCell {
    cell_id: CellId,
    state: CellState,
    ballot: ProposalNumber,
    acceptors: Vec<SocketAddr>,
    responses: Vec<FleaseMessage>,
    message_sent: Option<FleaseMessage>,
    view_id: i32,
    num_failures: u32,
    handover_to: Option<String>,
    request_master_epoch: bool,
    master_epoch: i64,
    prev_lease: Flease,
    last_prepare_ms: i64,
    actions: VecDeque<String>,
}

impl ProposerCell {
    fn new(
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        sender_id: i32,
        request_master_epoch: bool,
        view_id: i32,
    ) -> Self {
        Self {
            prev_lease: Flease::empty(cell_id.clone()),
            cell_id,
            state: CellState::Idle,
            ballot: ProposalNumber::new(0, sender_id),
            acceptors,
            responses: Vec::new(),
            message_sent: None,
            view_id,
            num_failures: 0,
            handover_to: None,
            request_master_epoch,
            master_epoch: IGNORE_MASTER_EPOCH,
            last_prepare_ms: 0,
            actions: VecDeque::with_capacity(MAX_CELL_ACTIONS),
        }
    }

    /// Cell id.
    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// Current phase.
    pub fn state(&self) -> CellState {
        self.state
    }

    /// Ballot the next or current round uses.
    pub fn ballot(&self) -> ProposalNumber {
        self.ballot
    }

    /// Consecutive failed rounds.
    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    /// Master epoch chosen in the last acquisition.
    pub fn master_epoch(&self) -> i64 {
        self.master_epoch
    }

    /// Current view.
    pub fn view_id(&self) -> i32 {
        self.view_id
    }

    /// Last proposal sent, if a round is in progress or just learned.
    pub fn message_sent(&self) -> Option<&FleaseMessage> {
        self.message_sent.as_ref()
    }

    /// Last lease reported for this cell.
    pub fn prev_lease(&self) -> &Flease {
        &self.prev_lease
    }

    /// True while a handover started by this node is pending.
    pub fn is_handover_in_progress(&self) -> bool {
        self.handover_to.is_some()
    }

    fn action(&mut self, action: impl Into<String>) {
        if self.actions.len() == MAX_CELL_ACTIONS {
            self.actions.pop_front();
        }
        self.actions.push_back(action.into());
    }

    /// Adds a response to the current round. A repeat from an acceptor that
    /// already answered is dropped; the local acceptor's sender is `None`.
    fn add_response(&mut self, msg: FleaseMessage) -> bool {
        if self.responses.iter().any(|r| r.sender == msg.sender) {
            return false;
        }
        self.responses.push(msg);
        true
    }

    fn majority_available(&self) -> bool {
        // Remote acceptors plus the local one.
        self.responses.len() * 2 > self.acceptors.len() + 1
    }

    fn check_state(&self, holds: bool, detail: &str) -> Result<()> {
        if holds {
            Ok(())
        } else {
            tracing::error!(cell = %self.cell_id, state = ?self.state, detail, "invalid proposer state");
            Err(FleaseError::InvalidState {
                cell: self.cell_id.clone(),
                detail: detail.to_string(),
            })
        }
    }

    fn event(&self, kind: MessageKind) -> FleaseMessage {
        let mut timer = FleaseMessage::event(kind, self.cell_id.clone(), self.ballot);
        timer.view_id = self.view_id;
        timer
    }

    fn broadcast(&self, msg: &FleaseMessage, env: &mut Env<'_>) {
        for acceptor in &self.acceptors {
            env.sink.send_message(msg.clone(), *acceptor);
        }
    }

    fn acquire(&mut self, cfg: &FleaseConfig, env: &mut Env<'_>) -> Result<()> {
        self.action("acquire lease");
        let local = env.acceptor.local_lease_information(&self.cell_id, env.now_ms);
        if let Some(local) = local.filter(|l| l.has_not_timed_out(cfg, env.now_ms)) {
            tracing::debug!(cell = %self.cell_id, "request served from local state");
            self.action("returned local lease");
            env.sink.learned_event(
                &local.cell_id,
                local.lease_holder.as_deref(),
                local.lease_timeout_ms,
                local.master_epoch,
            );
            return Ok(());
        }

        if self.state == CellState::Idle {
            self.num_failures = 0;
            self.handover_to = None;
            self.start_prepare(cfg, cfg.identity.clone(), env)
        } else {
            self.action("acquire lease: not idle");
            tracing::debug!(cell = %self.cell_id, "cell is not idle, ignoring acquire");
            Ok(())
        }
    }

    fn check_owner(
        &self,
        op: &'static str,
        cfg: &FleaseConfig,
        env: &mut Env<'_>,
    ) -> Result<FleaseMessage> {
        let local = env
            .acceptor
            .local_lease_information(&self.cell_id, env.now_ms)
            .ok_or(FleaseError::NoLocalLease { op })?;
        if local.lease_holder.as_deref() != Some(cfg.identity.as_str()) {
            return Err(FleaseError::NotOwner {
                op,
                owner: local.lease_holder.clone().unwrap_or_default(),
            });
        }
        Ok(local)
    }

    fn check_time_left(
        &self,
        op: &'static str,
        local: &FleaseMessage,
        cfg: &FleaseConfig,
        now_ms: i64,
    ) -> Result<()> {
        let timeout_ms = local.lease_timeout_ms.saturating_sub(cfg.d_max_ms);
        let deadline_ms = now_ms.saturating_add(cfg.round_timeout_ms * 2);
        if timeout_ms < deadline_ms {
            return Err(FleaseError::NotEnoughTime {
                op,
                timeout_ms,
                deadline_ms,
            });
        }
        Ok(())
    }

    fn renew(&mut self, cfg: &FleaseConfig, env: &mut Env<'_>) -> Result<()> {
        self.action("renew lease");
        if self.is_handover_in_progress() {
            tracing::info!(cell = %self.cell_id, "handover in progress, renew canceled");
            return Ok(());
        }

        let local = match self.check_owner("renew", cfg, env) {
            Ok(local) => local,
            Err(e) => {
                self.action(format!("renew failed: {}", e));
                return Err(e);
            }
        };
        if local.has_timed_out(cfg, env.now_ms) {
            self.action("renew failed: lease timed out");
            return Err(FleaseError::LeaseTimedOut {
                timeout_ms: local.lease_timeout_ms.saturating_sub(cfg.d_max_ms),
                now_ms: env.now_ms,
            });
        }
        if let Err(e) = self.check_time_left("renew", &local, cfg, env.now_ms) {
            self.action("renew failed: not enough time");
            return Err(e);
        }
        if self.state != CellState::Idle {
            tracing::debug!(cell = %self.cell_id, state = ?self.state, "renew while round in progress, ignored");
            return Ok(());
        }

        // Renewals keep the epoch of the acquisition.
        self.request_master_epoch = false;
        self.start_prepare(cfg, cfg.identity.clone(), env)
    }

    fn handover(&mut self, new_owner: String, cfg: &FleaseConfig, env: &mut Env<'_>) -> Result<()> {
        self.action(format!("handover lease to {}", new_owner));
        if self.is_handover_in_progress() {
            return Err(FleaseError::HandoverInProgress(self.cell_id.clone()));
        }
        let local = self.check_owner("handover", cfg, env)?;
        self.check_time_left("handover", &local, cfg, env.now_ms)?;

        self.handover_to = Some(new_owner.clone());
        if self.state == CellState::Idle {
            // From here on the old holder can no longer assume exclusivity.
            env.sink
                .learned_event(&local.cell_id, None, 0, IGNORE_MASTER_EPOCH);
            self.start_prepare(cfg, new_owner, env)?;
        }
        Ok(())
    }

    fn start_prepare(
        &mut self,
        cfg: &FleaseConfig,
        lease_holder: String,
        env: &mut Env<'_>,
    ) -> Result<()> {
        self.action("prepare start");
        self.check_state(self.state == CellState::Idle, "prepare started while not idle")?;

        let now = env.now_ms;
        if self.last_prepare_ms + cfg.max_lease_timeout_ms < now {
            // Reseed from time, but never below a ballot already used.
            let seq = now.max(self.ballot.sequence().saturating_add(1));
            self.ballot = ProposalNumber::new(seq, cfg.effective_sender_id());
            tracing::debug!(cell = %self.cell_id, ballot = %self.ballot, "ballot reseeded from clock");
            self.action(format!("set ballot {}", self.ballot));
        }
        self.responses.clear();
        self.last_prepare_ms = now;

        let mut msg = FleaseMessage::new(MessageKind::Prepare, self.cell_id.clone());
        msg.proposal_no = self.ballot;
        msg.lease_holder = Some(lease_holder);
        msg.lease_timeout_ms = now + cfg.max_lease_timeout_ms;
        msg.send_timestamp_ms = now;
        msg.view_id = self.view_id;
        if self.request_master_epoch {
            msg.master_epoch = REQUEST_MASTER_EPOCH;
            self.action("request master epoch");
        }
        self.message_sent = Some(msg.clone());

        if cfg.debug_print_messages {
            tracing::trace!(cell = %self.cell_id, msg = %msg, "P start PREPARE");
        }
        self.broadcast(&msg, env);
        env.sink
            .request_timer(
                self.event(MessageKind::EventTimeoutPrepare),
                now + cfg.round_timeout_ms,
            );
        self.action("scheduled timeout");
        self.state = CellState::WaitForPrepAck;

        let local = env.acceptor.handle_prepare(&msg, now);
        if self.request_master_epoch && local.kind == MessageKind::PrepareAck {
            if let Some(epochs) = env.epochs.as_deref_mut() {
                epochs.send_master_epoch(local, PipelineStage::ProposerResponse);
                return Ok(());
            }
        }
        self.process_prepare_response(cfg, local, env)
    }

    fn process_prepare_response(
        &mut self,
        cfg: &FleaseConfig,
        msg: FleaseMessage,
        env: &mut Env<'_>,
    ) -> Result<()> {
        self.action("prepare process response");
        self.check_state(
            self.state == CellState::WaitForPrepAck,
            "prepare response outside WAIT_FOR_PREP_ACK",
        )?;
        let sent_ballot = match &self.message_sent {
            Some(sent) => sent.proposal_no,
            None => return self.check_state(false, "no PREPARE sent"),
        };

        match msg.kind {
            MessageKind::PrepareAck
            | MessageKind::PrepareNack
            | MessageKind::WrongView
            | MessageKind::EventTimeoutPrepare => {}
            _ => {
                if cfg.debug_print_messages {
                    tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore unexpected message");
                }
                return Ok(());
            }
        }

        let now = env.now_ms;
        if msg.send_timestamp_ms.saturating_add(cfg.message_timeout_ms) < now {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore message (too old)");
            }
            return Ok(());
        }
        if msg.send_timestamp_ms > now.saturating_add(cfg.d_max_ms) {
            tracing::error!(
                cell = %self.cell_id,
                send_ts = msg.send_timestamp_ms,
                now,
                d_max = cfg.d_max_ms,
                msg = %msg,
                "received message with timestamp too far in the future, clocks are not in sync, system is not in a safe state"
            );
            self.action(format!("out of sync message {} > {}+{}", msg.send_timestamp_ms, now, cfg.d_max_ms));
            self.action("prepare failed");
            self.cancel(cfg, FleaseError::ClockOutOfSync, 0, env);
            return Ok(());
        }
        if msg.proposal_no.before(&sent_ballot) {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore message (before my request)");
            }
            return Ok(());
        }
        if msg.kind == MessageKind::EventTimeoutPrepare {
            self.action("prepare timeout");
            self.cancel(
                cfg,
                FleaseError::round("did not receive enough responses for PREPARE"),
                0,
                env,
            );
            return Ok(());
        }

        if !self.add_response(msg) {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, "P ignore duplicate response");
            }
            return Ok(());
        }
        if !self.majority_available() {
            return Ok(());
        }
        tracing::debug!(cell = %self.cell_id, ballot = %self.ballot, responses = self.responses.len(), "P majority responded to PREPARE");

        let mut max_ballot = ProposalNumber::EMPTY;
        let mut prev_accepted: Option<&FleaseMessage> = None;
        let mut max_view_id = 0;
        for resp in &self.responses {
            match resp.kind {
                MessageKind::WrongView => {
                    max_view_id = max_view_id.max(resp.view_id);
                }
                MessageKind::PrepareAck => {
                    let newer = prev_accepted
                        .map_or(true, |p| resp.prev_proposal_no.after(&p.prev_proposal_no));
                    if !resp.prev_proposal_no.is_empty() && newer {
                        prev_accepted = Some(resp);
                    }
                }
                MessageKind::PrepareNack => {
                    if resp.prev_proposal_no.after(&max_ballot) {
                        max_ballot = resp.prev_proposal_no;
                    }
                }
                _ => {}
            }
        }
        let prev_accepted = prev_accepted.cloned();

        if max_view_id > self.view_id {
            self.action(format!("view outdated {}!={}", max_view_id, self.view_id));
            tracing::debug!(cell = %self.cell_id, local = self.view_id, max = max_view_id, "P prepare failed due to outdated view");
            env.sink.view_id_change_event(&self.cell_id, max_view_id, true);
            self.action("prepare failed");
            self.cancel(cfg, FleaseError::round("local viewId is outdated"), 0, env);
            return Ok(());
        }

        if !max_ballot.is_empty() {
            self.action("prepare overruled");
            self.overrule(max_ballot, env);
            tracing::debug!(cell = %self.cell_id, by = %max_ballot, ballot = %self.ballot, "P prepare overruled");
            self.cancel(
                cfg,
                FleaseError::round("local proposal was overruled by remote proposal"),
                0,
                env,
            );
            return Ok(());
        }

        match prev_accepted {
            Some(prev) => self.adopt_prior_value(cfg, &prev, now)?,
            None => self.action("prepare: no prior value"),
        }

        if self.request_master_epoch {
            let max_epoch = self
                .responses
                .iter()
                .filter(|r| r.kind == MessageKind::PrepareAck)
                .map(|r| r.master_epoch)
                .max()
                .unwrap_or(IGNORE_MASTER_EPOCH);
            self.check_state(max_epoch > IGNORE_MASTER_EPOCH, "no valid master epoch received")?;
            self.master_epoch = max_epoch.saturating_add(1);
            self.action(format!("max master epoch {}", max_epoch));
            tracing::debug!(cell = %self.cell_id, epoch = self.master_epoch, "P using master epoch");
        }

        self.responses.clear();
        self.action("prepare success");
        self.start_accept(cfg, env)
    }

    /// Defers to the most recent accepted value unless it is ours or expired.
    fn adopt_prior_value(
        &mut self,
        cfg: &FleaseConfig,
        prev: &FleaseMessage,
        now: i64,
    ) -> Result<()> {
        let holder = prev.lease_holder.clone();
        if prev.has_not_timed_out(cfg, now) {
            if holder.as_deref() == Some(cfg.identity.as_str()) {
                let (own, timeout) = match &self.message_sent {
                    Some(sent) => (
                        sent.lease_holder.as_deref() == Some(cfg.identity.as_str()),
                        sent.lease_timeout_ms,
                    ),
                    None => (false, 0),
                };
                self.check_state(
                    own || self.is_handover_in_progress(),
                    "renew of a lease proposed for someone else",
                )?;
                self.check_state(
                    timeout >= prev.lease_timeout_ms,
                    "renew proposes a shorter lease",
                )?;
                self.action("prepare implicit renew");
                tracing::debug!(cell = %self.cell_id, prev = %prev.prev_proposal_no, "P proceeding with my proposal (renew)");
            } else {
                self.action("prepare prior value");
                tracing::debug!(cell = %self.cell_id, holder = ?holder, timeout = prev.lease_timeout_ms, "P proceeding with prior value (still valid)");
                self.substitute(holder, prev.lease_timeout_ms);
            }
        } else if prev.has_timed_out(cfg, now) {
            self.action("prepare prior lease timed out");
            tracing::debug!(cell = %self.cell_id, "P proceeding with my proposal (old lease timed out)");
        } else {
            self.action("prepare prior value in grace period");
            tracing::debug!(cell = %self.cell_id, holder = ?holder, "P proceeding with prior value (grace period)");
            self.substitute(holder, prev.lease_timeout_ms);
        }
        Ok(())
    }

    fn substitute(&mut self, holder: Option<String>, lease_timeout_ms: i64) {
        if let Some(sent) = self.message_sent.as_mut() {
            sent.lease_holder = holder;
            sent.lease_timeout_ms = lease_timeout_ms;
        }
    }

    fn overrule(&mut self, competitor: ProposalNumber, env: &mut Env<'_>) {
        let jitter: i64 = env.rng.gen_range(1..=10);
        self.ballot = ProposalNumber::new(
            competitor.sequence().saturating_add(jitter),
            self.ballot.sender_id(),
        );
    }

    fn start_accept(&mut self, cfg: &FleaseConfig, env: &mut Env<'_>) -> Result<()> {
        self.action("accept start");
        self.state = CellState::WaitForAcceptAck;
        let (holder, timeout) = match &self.message_sent {
            Some(sent) => (sent.lease_holder.clone(), sent.lease_timeout_ms),
            None => return self.check_state(false, "accept without PREPARE"),
        };

        let now = env.now_ms;
        let mut msg = FleaseMessage::new(MessageKind::Accept, self.cell_id.clone());
        msg.proposal_no = self.ballot;
        msg.lease_holder = holder;
        msg.lease_timeout_ms = timeout;
        msg.send_timestamp_ms = now;
        msg.view_id = self.view_id;
        if self.request_master_epoch {
            msg.master_epoch = self.master_epoch;
        }
        self.message_sent = Some(msg.clone());

        if cfg.debug_print_messages {
            tracing::trace!(cell = %self.cell_id, msg = %msg, "P start ACCEPT");
        }
        self.broadcast(&msg, env);
        self.action("scheduled timeout");
        env.sink
            .request_timer(self.event(MessageKind::EventTimeoutAccept), now + cfg.round_timeout_ms);

        let local = env.acceptor.handle_accept(&msg, now);
        if self.request_master_epoch && local.kind == MessageKind::AcceptAck {
            if let Some(epochs) = env.epochs.as_deref_mut() {
                epochs.store_master_epoch(local, PipelineStage::ProposerResponse);
                return Ok(());
            }
        }
        self.process_accept_response(cfg, local, env)
    }

    fn process_accept_response(
        &mut self,
        cfg: &FleaseConfig,
        msg: FleaseMessage,
        env: &mut Env<'_>,
    ) -> Result<()> {
        self.action("accept process response");
        self.check_state(
            self.state == CellState::WaitForAcceptAck,
            "accept response outside WAIT_FOR_ACCEPT_ACK",
        )?;
        let sent_ballot = match &self.message_sent {
            Some(sent) => sent.proposal_no,
            None => return self.check_state(false, "no ACCEPT sent"),
        };

        let now = env.now_ms;
        if msg.send_timestamp_ms.saturating_add(cfg.message_timeout_ms) < now {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore message (too old)");
            }
            return Ok(());
        }
        if msg.send_timestamp_ms > now.saturating_add(cfg.d_max_ms) {
            tracing::error!(
                cell = %self.cell_id,
                send_ts = msg.send_timestamp_ms,
                now,
                d_max = cfg.d_max_ms,
                msg = %msg,
                "received message with timestamp too far in the future, clocks are not in sync, system is not in a safe state"
            );
            self.action(format!("out of sync message {} > {}+{}", msg.send_timestamp_ms, now, cfg.d_max_ms));
            self.action("accept failed");
            self.cancel(cfg, FleaseError::ClockOutOfSync, 0, env);
            return Ok(());
        }

        match msg.kind {
            MessageKind::AcceptAck
            | MessageKind::AcceptNack
            | MessageKind::WrongView
            | MessageKind::EventTimeoutAccept => {}
            _ => {
                if cfg.debug_print_messages {
                    tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore unexpected message");
                }
                return Ok(());
            }
        }
        if msg.proposal_no.before(&sent_ballot) {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, msg = %msg, "P ignore message (before my request)");
            }
            return Ok(());
        }
        if msg.kind == MessageKind::EventTimeoutAccept {
            self.action("accept timeout");
            self.cancel(
                cfg,
                FleaseError::round("did not receive enough responses for ACCEPT"),
                0,
                env,
            );
            return Ok(());
        }

        if !self.add_response(msg) {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, "P ignore duplicate response");
            }
            return Ok(());
        }
        if !self.majority_available() {
            return Ok(());
        }
        tracing::debug!(cell = %self.cell_id, ballot = %self.ballot, responses = self.responses.len(), "P majority responded to ACCEPT");

        // View and competing ballot are tracked independently, so a NACK is
        // never masked by a response that also raised the view.
        let mut max_view_id = 0;
        let mut max_ballot = ProposalNumber::EMPTY;
        for resp in &self.responses {
            max_view_id = max_view_id.max(resp.view_id);
            if resp.kind == MessageKind::AcceptNack && resp.prev_proposal_no.after(&max_ballot) {
                max_ballot = resp.prev_proposal_no;
            }
        }

        if max_view_id > self.view_id {
            self.action(format!("view outdated {}!={}", max_view_id, self.view_id));
            tracing::debug!(cell = %self.cell_id, local = self.view_id, max = max_view_id, "P accept failed due to outdated view");
            env.sink.view_id_change_event(&self.cell_id, max_view_id, true);
            self.cancel(cfg, FleaseError::round("local viewId is outdated"), 0, env);
            return Ok(());
        }

        if !max_ballot.is_empty() {
            self.action("accept overruled");
            self.overrule(max_ballot, env);
            tracing::debug!(cell = %self.cell_id, by = %max_ballot, ballot = %self.ballot, "P accept overruled");
            self.cancel(
                cfg,
                FleaseError::round("proposal was overruled by remote proposal during ACCEPT"),
                0,
                env,
            );
            return Ok(());
        }

        self.responses.clear();
        self.action("accept success");
        self.learn(cfg, env)
    }

    fn learn(&mut self, cfg: &FleaseConfig, env: &mut Env<'_>) -> Result<()> {
        self.action("learn start");
        self.state = CellState::Idle;
        let (holder, timeout) = match &self.message_sent {
            Some(sent) => (sent.lease_holder.clone(), sent.lease_timeout_ms),
            None => return self.check_state(false, "learn without ACCEPT"),
        };

        let now = env.now_ms;
        let mut msg = FleaseMessage::new(MessageKind::Learn, self.cell_id.clone());
        msg.proposal_no = self.ballot;
        msg.lease_holder = holder.clone();
        msg.lease_timeout_ms = timeout;
        msg.send_timestamp_ms = now;
        msg.view_id = self.view_id;
        if self.request_master_epoch {
            self.check_state(
                self.master_epoch > IGNORE_MASTER_EPOCH,
                "learn without master epoch",
            )?;
        }
        msg.master_epoch = self.master_epoch;
        self.message_sent = Some(msg.clone());

        if msg.has_timed_out(cfg, now) {
            self.action("learn: lease timed out");
            self.ballot = self.ballot.bumped(1);
            tracing::debug!(cell = %self.cell_id, msg = %msg, "P finished round, lease has timed out, restart prepare");
            let holder = holder.unwrap_or_else(|| cfg.identity.clone());
            return self.start_prepare(cfg, holder, env);
        }

        if !msg.has_not_timed_out(cfg, now) {
            self.action("learn: lease in grace period");
            self.action("scheduled restart");
            let wait_ms = msg.lease_timeout_ms.saturating_sub(now).saturating_add(cfg.d_max_ms);
            tracing::debug!(cell = %self.cell_id, wait_ms, "P finished round, lease is in grace period, restart scheduled");
            self.cancel(
                cfg,
                FleaseError::round("current lease not yet timed out"),
                wait_ms,
                env,
            );
            return Ok(());
        }

        self.ballot = self.ballot.bumped(1);
        tracing::debug!(cell = %self.cell_id, holder = ?msg.lease_holder, timeout = msg.lease_timeout_ms, "P finished round, lease is valid");
        if cfg.send_learn_messages {
            if cfg.debug_print_messages {
                tracing::trace!(cell = %self.cell_id, msg = %msg, "P start LEARN");
            }
            self.broadcast(&msg, env);
        }
        env.acceptor.handle_learn(&msg, now, &mut *env.sink);

        if msg.lease_holder.as_deref() == Some(cfg.identity.as_str()) {
            let renew_at = msg.lease_timeout_ms.saturating_sub(cfg.round_timeout_ms * 4);
            if now < renew_at {
                self.action("scheduled renew");
                env.sink.request_timer(self.event(MessageKind::EventRenew), renew_at);
                tracing::debug!(cell = %self.cell_id, renew_at, "scheduled renew");
            } else {
                self.action("learn: too late for renew");
                self.action("scheduled restart");
                let wait_ms = msg
                    .lease_timeout_ms
                    .saturating_sub(now)
                    .saturating_add(cfg.d_max_ms);
                tracing::debug!(cell = %self.cell_id, wait_ms, now, renew_at, "too late to schedule renew, restart scheduled");
                self.cancel(
                    cfg,
                    FleaseError::round(format!(
                        "too late for renew, re-start after lease has timed out in {}ms",
                        wait_ms
                    )),
                    wait_ms,
                    env,
                );
            }
        }
        Ok(())
    }

    fn cancel(
        &mut self,
        cfg: &FleaseConfig,
        reason: FleaseError,
        retry_after_ms: i64,
        env: &mut Env<'_>,
    ) {
        self.action("cancelled");
        self.num_failures += 1;
        tracing::debug!(cell = %self.cell_id, failures = self.num_failures, reason = %reason, "P proposal failed");
        self.state = CellState::Idle;
        self.message_sent = None;
        self.ballot = self.ballot.bumped(1);
        self.responses.clear();

        let now = env.now_ms;
        if self.num_failures > cfg.max_retries {
            self.action("lease failed");
            let error = reason.with_cell_trace(self.to_string());
            tracing::error!(cell = %self.cell_id, error = %error, "lease failed after {} retries", cfg.max_retries);
            env.sink.lease_failed(&self.cell_id, error);
            self.num_failures = 0;
            self.action("scheduled restart");
            env.sink
                .request_timer(
                    self.event(MessageKind::EventRestart),
                    now + cfg.max_lease_timeout_ms,
                );
        } else {
            self.action("scheduled restart");
            let retry_ms = if retry_after_ms > 0 {
                retry_after_ms
            } else {
                50 + env.rng.gen_range(0..100)
            };
            env.sink
                .request_timer(self.event(MessageKind::EventRestart), now.saturating_add(retry_ms));
        }
    }

    fn reset(&mut self) {
        self.state = CellState::Idle;
        self.message_sent = None;
        self.ballot = self.ballot.bumped(1);
        self.responses.clear();
        self.num_failures = 0;
    }
}

impl fmt::Display for ProposerCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cell {} state={:?} ballot={} view={} failures={} epoch={} handover={:?} actions=[{}]",
            self.cell_id,
            self.state,
            self.ballot,
            self.view_id,
            self.num_failures,
            self.master_epoch,
            self.handover_to,
            self.actions.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    }
}

/// The proposer half of a Flease node: one [`ProposerCell`] per open cell.
pub struct FleaseProposer {
    config: FleaseConfig,
    cells: HashMap<CellId, ProposerCell>,
}

impl FleaseProposer {
    /// Creates a proposer with no open cells.
    pub fn new(config: FleaseConfig) -> Self {
        tracing::debug!(identity = %config.identity, sender_id = config.effective_sender_id(), "creating flease proposer");
        Self {
            config,
            cells: HashMap::new(),
        }
    }

    /// Proposer configuration.
    pub fn config(&self) -> &FleaseConfig {
        &self.config
    }

    /// Inspects an open cell.
    pub fn cell(&self, cell_id: &CellId) -> Option<&ProposerCell> {
        self.cells.get(cell_id)
    }

    /// Ids of all open cells.
    pub fn open_cells(&self) -> impl Iterator<Item = &CellId> {
        self.cells.keys()
    }

    /// Opens a cell and tries to acquire its lease for this node.
    pub fn open_cell(
        &mut self,
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
        env: &mut Env<'_>,
    ) -> Result<()> {
        if self.cells.contains_key(&cell_id) {
            return Err(FleaseError::CellAlreadyOpen(cell_id));
        }
        let mut cell = ProposerCell::new(
            cell_id.clone(),
            acceptors,
            self.config.effective_sender_id(),
            request_master_epoch,
            view_id,
        );
        cell.action("cell opened");
        tracing::debug!(cell = %cell_id, "P created new cell");
        let result = cell.acquire(&self.config, env);
        self.cells.insert(cell_id, cell);
        result
    }

    /// Forgets a cell. Pending timers for it are dropped on delivery.
    pub fn close_cell(&mut self, cell_id: &CellId) -> bool {
        let closed = self.cells.remove(cell_id).is_some();
        if closed {
            tracing::debug!(cell = %cell_id, "P closed cell");
        }
        closed
    }

    /// Renews the lease this node holds. Fails without any network traffic
    /// if the local lease is missing, foreign, expired or too close to expiry.
    pub fn renew_lease(&mut self, cell_id: &CellId, env: &mut Env<'_>) -> Result<()> {
        match self.cells.get_mut(cell_id) {
            Some(cell) => cell.renew(&self.config, env),
            None => Err(FleaseError::CellNotOpen(cell_id.clone())),
        }
    }

    /// Proposes `new_owner` as the next holder of a lease this node holds.
    pub fn handover_lease(
        &mut self,
        cell_id: &CellId,
        new_owner: String,
        env: &mut Env<'_>,
    ) -> Result<()> {
        match self.cells.get_mut(cell_id) {
            Some(cell) => cell.handover(new_owner, &self.config, env),
            None => Err(FleaseError::CellNotOpen(cell_id.clone())),
        }
    }

    /// Sets the view of an open cell.
    pub fn set_view_id(&mut self, cell_id: &CellId, view_id: i32) {
        if let Some(cell) = self.cells.get_mut(cell_id) {
            cell.view_id = view_id;
            cell.action(format!("set view {}", view_id));
        }
    }

    /// Records `lease` as the cell's current lease; returns the previous one
    /// if it differed.
    pub fn update_prev_lease_for_cell(
        &mut self,
        cell_id: &CellId,
        lease: Flease,
    ) -> Option<Flease> {
        let cell = self.cells.get_mut(cell_id)?;
        if cell.prev_lease != lease {
            Some(std::mem::replace(&mut cell.prev_lease, lease))
        } else {
            None
        }
    }

    /// Ballot the cell's next round would use, or EMPTY if not open.
    pub fn current_ballot(&self, cell_id: &CellId) -> ProposalNumber {
        self.cells
            .get(cell_id)
            .map_or(ProposalNumber::EMPTY, |c| c.ballot)
    }

    /// Single entry point for responses and timer events.
    pub fn process_message(&mut self, msg: FleaseMessage, env: &mut Env<'_>) {
        let config = &self.config;
        let Some(cell) = self.cells.get_mut(&msg.cell_id) else {
            if config.debug_print_messages {
                tracing::trace!(cell = %msg.cell_id, sender = ?msg.sender, "P drop message for unknown cell");
            }
            return;
        };

        if cell.view_id == VIEW_ID_INVALIDATED {
            if config.debug_print_messages {
                tracing::trace!(cell = %cell.cell_id, "P drop message, local view invalidated");
            }
            return;
        }
        if cell.view_id > msg.view_id {
            if config.debug_print_messages {
                tracing::trace!(cell = %cell.cell_id, local = cell.view_id, remote = msg.view_id, "P drop message from outdated view");
            }
            return;
        }

        let result = match cell.state {
            CellState::Idle => match msg.kind {
                MessageKind::EventRestart => {
                    cell.action("restart event");
                    cell.start_prepare(config, config.identity.clone(), env)
                }
                MessageKind::EventRenew => {
                    cell.action("renew event");
                    if let Err(e) = cell.renew(config, env) {
                        cell.action(format!("internal error, cell reset: {}", e));
                        tracing::error!(cell = %cell.cell_id, error = %e, "P renew failed");
                        cell.reset();
                        let wait_ms = config.d_max_ms + config.max_lease_timeout_ms;
                        tracing::debug!(cell = %cell.cell_id, wait_ms, "P cannot renew, scheduled restart");
                        cell.action("scheduled restart");
                        env.sink
                            .request_timer(
                                cell.event(MessageKind::EventRestart),
                                env.now_ms + wait_ms,
                            );
                    }
                    Ok(())
                }
                _ => {
                    if config.debug_print_messages {
                        tracing::trace!(cell = %cell.cell_id, msg = %msg, "P dropped message in state IDLE");
                    }
                    Ok(())
                }
            },
            CellState::WaitForPrepAck => cell.process_prepare_response(config, msg, env),
            CellState::WaitForAcceptAck => cell.process_accept_response(config, msg, env),
        };

        if let Err(e) = result {
            tracing::error!(cell = %cell.cell_id, error = %e, cell_state = %cell, "exception in proposer, cancelling round");
            cell.cancel(config, e, 0, env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Effect, Outbox};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        proposer: FleaseProposer,
        acceptor: FleaseAcceptor,
        outbox: Outbox,
        rng: StdRng,
        now_ms: i64,
    }

    impl Harness {
        fn new(remote: usize) -> (Self, Vec<SocketAddr>) {
            let config = FleaseConfig::new("me");
            let acceptors = (0..remote).map(remote_addr).collect();
            (
                Harness {
                    proposer: FleaseProposer::new(config.clone()),
                    acceptor: FleaseAcceptor::new(config),
                    outbox: Outbox::new(),
                    rng: StdRng::seed_from_u64(7),
                    now_ms: NOW,
                },
                acceptors,
            )
        }

        fn with_env<T>(&mut self, f: impl FnOnce(&mut FleaseProposer, &mut Env<'_>) -> T) -> T {
            let mut env = Env {
                now_ms: self.now_ms,
                acceptor: &mut self.acceptor,
                sink: &mut self.outbox,
                epochs: None,
                rng: &mut self.rng,
            };
            f(&mut self.proposer, &mut env)
        }

        fn open(&mut self, acceptors: Vec<SocketAddr>) {
            self.with_env(|p, env| p.open_cell(cell(), acceptors, false, 0, env))
                .unwrap();
        }

        fn deliver(&mut self, msg: FleaseMessage) {
            self.with_env(|p, env| p.process_message(msg, env));
        }

        fn state(&self) -> CellState {
            self.proposer.cell(&cell()).unwrap().state()
        }

        fn last_sent(&self, kind: MessageKind) -> FleaseMessage {
            self.outbox
                .sent()
                .filter(|(m, _)| m.kind == kind)
                .map(|(m, _)| m.clone())
                .last()
                .unwrap()
        }
    }

    fn cell() -> CellId {
        CellId::from("cell-1")
    }

    fn remote_addr(i: usize) -> SocketAddr {
        format!("127.0.0.1:{}", 9000 + i).parse().unwrap()
    }

    fn ack_for(req: &FleaseMessage, kind: MessageKind, now: i64) -> FleaseMessage {
        ack_from(req, kind, now, 0)
    }

    fn ack_from(
        req: &FleaseMessage,
        kind: MessageKind,
        now: i64,
        acceptor: usize,
    ) -> FleaseMessage {
        let mut ack = req.reply(kind);
        ack.sender = Some(remote_addr(acceptor));
        ack.prev_proposal_no = ProposalNumber::EMPTY;
        ack.send_timestamp_ms = now;
        ack
    }

    #[test]
    fn test_open_cell_sends_prepare_to_all_acceptors() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors.clone());
        let prepares: Vec<_> = h
            .outbox
            .sent()
            .filter(|(m, _)| m.kind == MessageKind::Prepare)
            .map(|(_, to)| to)
            .collect();
        assert_eq!(prepares, acceptors);
        assert_eq!(h.state(), CellState::WaitForPrepAck);
        let prepare = h.last_sent(MessageKind::Prepare);
        assert_eq!(prepare.lease_holder.as_deref(), Some("me"));
        assert_eq!(prepare.lease_timeout_ms, NOW + 14_000);
        assert_eq!(prepare.proposal_no.sequence(), NOW);
        assert!(h
            .outbox
            .timers()
            .any(|(m, at)| m.kind == MessageKind::EventTimeoutPrepare && at == NOW + 1000));
    }

    #[test]
    fn test_open_cell_twice_fails() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors.clone());
        let err = h
            .with_env(|p, env| p.open_cell(cell(), acceptors, false, 0, env))
            .unwrap_err();
        assert_eq!(err, FleaseError::CellAlreadyOpen(cell()));
    }

    #[test]
    fn test_full_round_learns_lease() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, NOW));
        assert_eq!(h.state(), CellState::WaitForAcceptAck);

        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.proposal_no, prepare.proposal_no);
        h.deliver(ack_for(&accept, MessageKind::AcceptAck, NOW));
        assert_eq!(h.state(), CellState::Idle);

        let learned: Vec<_> = h
            .outbox
            .effects()
            .iter()
            .filter_map(|e| match e {
                Effect::Learned(l) => Some(l.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].holder.as_deref(), Some("me"));
        assert!(h.outbox.sent().any(|(m, _)| m.kind == MessageKind::Learn));
        assert!(h.outbox.timers().any(|(m, at)| m.kind == MessageKind::EventRenew
            && at == NOW + 14_000 - 4 * 1000));
        assert!(h.proposer.current_ballot(&cell()).after(&prepare.proposal_no));
    }

    #[test]
    fn test_no_progress_without_majority() {
        // Four remote acceptors plus the local one: three responses needed.
        let (mut h, acceptors) = Harness::new(4);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, NOW));
        assert_eq!(h.state(), CellState::WaitForPrepAck);
        h.deliver(ack_from(&prepare, MessageKind::PrepareAck, NOW, 1));
        assert_eq!(h.state(), CellState::WaitForAcceptAck);
    }

    #[test]
    fn test_duplicate_responses_do_not_form_majority() {
        // Four remote acceptors plus the local one: three distinct responders needed.
        let (mut h, acceptors) = Harness::new(4);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        for _ in 0..4 {
            h.deliver(ack_for(&prepare, MessageKind::PrepareAck, NOW));
        }
        assert_eq!(h.state(), CellState::WaitForPrepAck);
        h.deliver(ack_from(&prepare, MessageKind::PrepareAck, NOW, 1));
        assert_eq!(h.state(), CellState::WaitForAcceptAck);

        let accept = h.last_sent(MessageKind::Accept);
        for _ in 0..4 {
            h.deliver(ack_from(&accept, MessageKind::AcceptAck, NOW, 2));
        }
        assert_eq!(h.state(), CellState::WaitForAcceptAck);
        assert!(!h.outbox.sent().any(|(m, _)| m.kind == MessageKind::Learn));
        h.deliver(ack_from(&accept, MessageKind::AcceptAck, NOW, 3));
        assert_eq!(h.state(), CellState::Idle);
    }

    #[test]
    fn test_far_future_timestamp_aborts_round() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, i64::MAX));
        assert_eq!(h.state(), CellState::Idle);
        assert_eq!(h.proposer.cell(&cell()).unwrap().num_failures(), 1);
    }

    #[test]
    fn test_nack_with_maximal_ballot_saturates() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut nack = ack_for(&prepare, MessageKind::PrepareNack, NOW);
        nack.prev_proposal_no = ProposalNumber::new(i64::MAX, 99);
        h.deliver(nack);
        assert_eq!(h.state(), CellState::Idle);
        assert_eq!(h.proposer.current_ballot(&cell()).sequence(), i64::MAX);
    }

    #[test]
    fn test_prior_value_with_maximal_timeout_is_adopted() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        ack.prev_proposal_no = ProposalNumber::new(NOW - 1, 99);
        ack.lease_holder = Some("other".to_string());
        ack.lease_timeout_ms = i64::MAX;
        h.deliver(ack);
        assert_eq!(h.state(), CellState::WaitForAcceptAck);

        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.lease_holder.as_deref(), Some("other"));
        assert_eq!(accept.lease_timeout_ms, i64::MAX);
        h.deliver(ack_for(&accept, MessageKind::AcceptAck, NOW));
        assert_eq!(h.state(), CellState::Idle);
        assert!(h.outbox.effects().iter().any(|e| matches!(
            e,
            Effect::Learned(l)
                if l.holder.as_deref() == Some("other") && l.lease_timeout_ms == i64::MAX
        )));
    }

    #[test]
    fn test_prepare_timeout_cancels_and_retries_with_jitter() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let mut timer = h
            .outbox
            .timers()
            .find(|(m, _)| m.kind == MessageKind::EventTimeoutPrepare)
            .map(|(m, _)| m.clone())
            .unwrap();
        h.now_ms += 1000;
        timer.send_timestamp_ms = h.now_ms;
        h.outbox.take();
        h.deliver(timer);
        assert_eq!(h.state(), CellState::Idle);
        assert_eq!(h.proposer.cell(&cell()).unwrap().num_failures(), 1);
        let (_, at) = h
            .outbox
            .timers()
            .find(|(m, _)| m.kind == MessageKind::EventRestart)
            .unwrap();
        assert!((h.now_ms + 50..h.now_ms + 150).contains(&at));
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let mut stale = h
            .outbox
            .timers()
            .find(|(m, _)| m.kind == MessageKind::EventTimeoutPrepare)
            .map(|(m, _)| m.clone())
            .unwrap();
        stale.proposal_no = stale.proposal_no.bumped(-1);
        stale.send_timestamp_ms = NOW;
        h.deliver(stale);
        assert_eq!(h.state(), CellState::WaitForPrepAck);
    }

    #[test]
    fn test_clock_skew_aborts_round_regardless_of_acks() {
        let (mut h, acceptors) = Harness::new(4);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, NOW));
        let skewed = ack_for(&prepare, MessageKind::PrepareAck, NOW + 1000 + 1);
        h.deliver(skewed);
        assert_eq!(h.state(), CellState::Idle);
        assert_eq!(h.proposer.cell(&cell()).unwrap().num_failures(), 1);
        assert!(!h.outbox.sent().any(|(m, _)| m.kind == MessageKind::Accept));
    }

    #[test]
    fn test_nack_overrules_with_jittered_ballot() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let competitor = ProposalNumber::new(NOW + 500, 99);
        let mut nack = ack_for(&prepare, MessageKind::PrepareNack, NOW);
        nack.prev_proposal_no = competitor;
        h.deliver(nack);
        assert_eq!(h.state(), CellState::Idle);
        let ballot = h.proposer.current_ballot(&cell());
        // Overrule adds 1..=10, cancel adds one more.
        assert!(ballot.sequence() >= competitor.sequence() + 2);
        assert!(ballot.sequence() <= competitor.sequence() + 11);
        assert_eq!(ballot.sender_id(), prepare.proposal_no.sender_id());
    }

    #[test]
    fn test_prior_valid_lease_of_other_holder_is_adopted() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        ack.prev_proposal_no = ProposalNumber::new(NOW - 10, 5);
        ack.lease_holder = Some("other".into());
        ack.lease_timeout_ms = NOW + 5000;
        h.deliver(ack);
        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.lease_holder.as_deref(), Some("other"));
        assert_eq!(accept.lease_timeout_ms, NOW + 5000);
    }

    #[test]
    fn test_prior_expired_lease_is_overwritten() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        ack.prev_proposal_no = ProposalNumber::new(NOW - 10, 5);
        ack.lease_holder = Some("other".into());
        ack.lease_timeout_ms = NOW - 1000 - 1;
        h.deliver(ack);
        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.lease_holder.as_deref(), Some("me"));
    }

    #[test]
    fn test_prior_lease_in_grace_period_is_adopted() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        ack.prev_proposal_no = ProposalNumber::new(NOW - 10, 5);
        ack.lease_holder = Some("other".into());
        ack.lease_timeout_ms = NOW + 200;
        h.deliver(ack);
        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.lease_holder.as_deref(), Some("other"));
        assert_eq!(accept.lease_timeout_ms, NOW + 200);
    }

    #[test]
    fn test_wrong_view_notifies_and_cancels() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut wrong = ack_for(&prepare, MessageKind::WrongView, NOW);
        wrong.view_id = 4;
        h.deliver(wrong);
        assert_eq!(h.state(), CellState::Idle);
        assert!(h.outbox.effects().iter().any(|e| matches!(
            e,
            Effect::ViewChange { view_id: 4, on_proposal: true, .. }
        )));
        // The new view is reported, not adopted.
        assert_eq!(h.proposer.cell(&cell()).unwrap().view_id(), 0);
    }

    #[test]
    fn test_accept_nack_first_in_nonzero_view_still_overrules() {
        // A NACK arriving first used to be masked when its view raised the
        // running maximum; view and ballot are now tracked separately.
        let (mut h, acceptors) = Harness::new(2);
        h.with_env(|p, env| p.open_cell(cell(), acceptors, false, 3, env))
            .unwrap();
        let prepare = h.last_sent(MessageKind::Prepare);
        let mut remote_ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        remote_ack.view_id = 3;
        h.deliver(remote_ack);
        assert_eq!(h.state(), CellState::WaitForAcceptAck);

        // Restart the accept phase's collection with a NACK in front.
        let accept = h.last_sent(MessageKind::Accept);
        let cell_state = h.proposer.cells.get_mut(&cell()).unwrap();
        cell_state.responses.clear();
        let mut nack = ack_for(&accept, MessageKind::AcceptNack, NOW);
        nack.prev_proposal_no = ProposalNumber::new(NOW + 77, 42);
        nack.view_id = 3;
        h.deliver(nack);
        let mut ack = ack_from(&accept, MessageKind::AcceptAck, NOW, 1);
        ack.view_id = 3;
        h.deliver(ack);

        assert_eq!(h.state(), CellState::Idle);
        assert!(!h.outbox.sent().any(|(m, _)| m.kind == MessageKind::Learn));
        assert!(h.proposer.current_ballot(&cell()).sequence() > NOW + 77);
    }

    #[test]
    fn test_retries_exhausted_reports_lease_failed_with_trace() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        for _ in 0..=3 {
            let mut timer = h
                .outbox
                .timers()
                .filter(|(m, _)| m.kind == MessageKind::EventTimeoutPrepare)
                .map(|(m, _)| m.clone())
                .last()
                .unwrap();
            timer.send_timestamp_ms = h.now_ms;
            h.outbox.take();
            h.deliver(timer);
            let restart = h
                .outbox
                .timers()
                .find(|(m, _)| m.kind == MessageKind::EventRestart)
                .map(|(m, _)| m.clone())
                .unwrap();
            if h.outbox.effects().iter().any(|e| matches!(e, Effect::LeaseFailed { .. })) {
                break;
            }
            h.deliver(restart);
        }
        let failed = h
            .outbox
            .effects()
            .iter()
            .find_map(|e| match e {
                Effect::LeaseFailed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        match failed {
            FleaseError::LeaseFailed { trace, .. } => assert!(trace.contains("prepare timeout")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h
            .outbox
            .timers()
            .any(|(m, at)| m.kind == MessageKind::EventRestart && at == h.now_ms + 14_000));
        assert_eq!(h.proposer.cell(&cell()).unwrap().num_failures(), 0);
    }

    fn acquire(h: &mut Harness, acceptors: Vec<SocketAddr>) {
        h.open(acceptors);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, h.now_ms));
        let accept = h.last_sent(MessageKind::Accept);
        h.deliver(ack_for(&accept, MessageKind::AcceptAck, h.now_ms));
        h.outbox.take();
    }

    #[test]
    fn test_renew_precondition_boundary() {
        let (mut h, acceptors) = Harness::new(2);
        acquire(&mut h, acceptors);
        let timeout = NOW + 14_000;
        let (d_max, round) = (1000, 1000);

        h.now_ms = timeout - d_max - 2 * round + 1;
        let err = h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap_err();
        assert!(matches!(err, FleaseError::NotEnoughTime { .. }));
        assert_eq!(h.outbox.sent().count(), 0);

        h.now_ms -= 1;
        h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap();
        assert!(h.outbox.sent().any(|(m, _)| m.kind == MessageKind::Prepare));
    }

    #[test]
    fn test_renew_requires_ownership_and_local_lease() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let err = h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap_err();
        assert_eq!(err, FleaseError::NoLocalLease { op: "renew" });

        let mut learn = FleaseMessage::new(MessageKind::Learn, cell());
        learn.proposal_no = ProposalNumber::new(NOW + 100_000, 9);
        learn.lease_holder = Some("other".into());
        learn.lease_timeout_ms = NOW + 10_000;
        let now = h.now_ms;
        h.acceptor.handle_learn(&learn, now, &mut h.outbox);
        let err = h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap_err();
        assert!(matches!(err, FleaseError::NotOwner { .. }));
    }

    #[test]
    fn test_acquire_with_master_epoch_then_renew_without() {
        let (mut h, acceptors) = Harness::new(2);
        h.with_env(|p, env| p.open_cell(cell(), acceptors, true, 0, env))
            .unwrap();
        let prepare = h.last_sent(MessageKind::Prepare);
        assert_eq!(prepare.master_epoch, REQUEST_MASTER_EPOCH);
        let mut ack = ack_for(&prepare, MessageKind::PrepareAck, NOW);
        ack.master_epoch = 4;
        h.deliver(ack);
        let accept = h.last_sent(MessageKind::Accept);
        assert_eq!(accept.master_epoch, 5);
        h.deliver(ack_for(&accept, MessageKind::AcceptAck, NOW));
        assert!(h
            .outbox
            .effects()
            .iter()
            .any(|e| matches!(e, Effect::Learned(l) if l.master_epoch == 5)));
        h.outbox.take();

        h.now_ms += 1000;
        h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap();
        let renew = h.last_sent(MessageKind::Prepare);
        assert_eq!(renew.master_epoch, IGNORE_MASTER_EPOCH);
        assert_eq!(h.proposer.cell(&cell()).unwrap().master_epoch(), 5);
    }

    #[test]
    fn test_open_served_from_local_state() {
        let (mut h, acceptors) = Harness::new(2);
        let mut learn = FleaseMessage::new(MessageKind::Learn, cell());
        learn.proposal_no = ProposalNumber::new(NOW, 9);
        learn.lease_holder = Some("other".into());
        learn.lease_timeout_ms = NOW + 10_000;
        let now = h.now_ms;
        h.acceptor.handle_learn(&learn, now, &mut h.outbox);
        h.outbox.take();
        h.open(acceptors);
        assert_eq!(h.outbox.sent().count(), 0);
        assert!(matches!(&h.outbox.effects()[0], Effect::Learned(l) if l.holder.as_deref() == Some("other")));
        assert_eq!(h.state(), CellState::Idle);
    }

    #[test]
    fn test_handover_notifies_indeterminate_and_proposes_new_owner() {
        let (mut h, acceptors) = Harness::new(2);
        acquire(&mut h, acceptors);
        h.now_ms += 100;
        h.with_env(|p, env| p.handover_lease(&cell(), "next".into(), env))
            .unwrap();
        assert!(matches!(&h.outbox.effects()[0], Effect::Learned(l) if l.holder.is_none()));
        let prepare = h.last_sent(MessageKind::Prepare);
        assert_eq!(prepare.lease_holder.as_deref(), Some("next"));
        assert!(h.proposer.cell(&cell()).unwrap().is_handover_in_progress());
        // Renew is a no-op during handover, a second handover is refused.
        h.with_env(|p, env| p.renew_lease(&cell(), env)).unwrap();
        let second = h.with_env(|p, env| p.handover_lease(&cell(), "other".into(), env));
        assert_eq!(second, Err(FleaseError::HandoverInProgress(cell())));
    }

    #[test]
    fn test_ballots_strictly_increase_across_cancels() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let mut last = h.last_sent(MessageKind::Prepare).proposal_no;
        for _ in 0..10 {
            let mut timer = h
                .outbox
                .timers()
                .filter(|(m, _)| m.kind == MessageKind::EventTimeoutPrepare)
                .map(|(m, _)| m.clone())
                .last()
                .unwrap();
            h.now_ms += 1000;
            timer.send_timestamp_ms = h.now_ms;
            h.outbox.take();
            h.deliver(timer);
            let mut restart = h
                .outbox
                .timers()
                .find(|(m, _)| m.kind == MessageKind::EventRestart)
                .map(|(m, _)| m.clone())
                .unwrap();
            h.now_ms += 100;
            restart.send_timestamp_ms = h.now_ms;
            h.deliver(restart);
            let next = h.last_sent(MessageKind::Prepare).proposal_no;
            assert!(next.after(&last), "{} !> {}", next, last);
            last = next;
        }
    }

    #[test]
    fn test_invalidated_view_drops_everything() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        h.proposer.set_view_id(&cell(), VIEW_ID_INVALIDATED);
        let prepare = h.last_sent(MessageKind::Prepare);
        h.deliver(ack_for(&prepare, MessageKind::PrepareAck, NOW));
        assert_eq!(h.state(), CellState::WaitForPrepAck);
    }

    #[test]
    fn test_update_prev_lease_reports_changes_only() {
        let (mut h, acceptors) = Harness::new(2);
        h.open(acceptors);
        let lease = Flease::new(cell(), Some("me".into()), NOW + 1, 1);
        let prev = h.proposer.update_prev_lease_for_cell(&cell(), lease.clone());
        assert_eq!(prev, Some(Flease::empty(cell())));
        assert_eq!(h.proposer.update_prev_lease_for_cell(&cell(), lease), None);
    }
}
