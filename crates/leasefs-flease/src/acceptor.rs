//! Local Flease acceptor.
//!
//! Answers PREPARE/ACCEPT/LEARN for every cell this node accepts for. All
//! per-cell state lives in one map owned by the acceptor, and the acceptor is
//! owned by the single stage task, so no two requests for a cell ever
//! interleave.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::comm::FleaseListener;
use crate::config::FleaseConfig;
use crate::error::Result;
use crate::types::{CellId, FleaseMessage, MessageKind, VIEW_ID_INVALIDATED};

/// Per-cell acceptor record.
#[derive(Debug, Clone, Default)]
struct AcceptorCell {
    prepared: Option<FleaseMessage>,
    accepted: Option<FleaseMessage>,
    latest_learn: Option<FleaseMessage>,
    view_id: i32,
    view_invalidated: bool,
    last_access_ms: i64,
}

impl AcceptorCell {
    fn prepared_after(&self, msg: &FleaseMessage) -> bool {
        self.prepared.as_ref().is_some_and(|p| p.after(msg))
    }

    fn accepted_after(&self, msg: &FleaseMessage) -> bool {
        self.accepted.as_ref().is_some_and(|a| a.after(msg))
    }
}

/// The acceptor half of a Flease node.
pub struct FleaseAcceptor {
    config: FleaseConfig,
    cells: HashMap<CellId, AcceptorCell>,
    wait_until_ms: i64,
    lockfile: Option<PathBuf>,
}

impl FleaseAcceptor {
    /// Creates an acceptor without crash-restart protection.
    pub fn new(config: FleaseConfig) -> Self {
        Self {
            config,
            cells: HashMap::new(),
            wait_until_ms: 0,
            lockfile: None,
        }
    }

    /// Creates an acceptor guarded by a lock file in `lock_dir`.
    ///
    /// If the lock file is left over from an unclean shutdown the acceptor
    /// stays silent for `restart_wait_ms`, since it may have forgotten
    /// promises it made before the crash.
    pub fn with_lock_dir(config: FleaseConfig, lock_dir: &Path, now_ms: i64) -> Result<Self> {
        let lockfile = lock_dir.join(format!("flease.{}.lock", config.effective_sender_id()));
        let wait_until_ms = if lockfile.exists() {
            let until = now_ms + config.restart_wait_ms;
            tracing::warn!(
                lockfile = %lockfile.display(),
                restart_wait_ms = config.restart_wait_ms,
                "lock file exists, acceptor was not shut down cleanly; staying silent"
            );
            until
        } else {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lockfile)?;
            0
        };
        Ok(Self {
            config,
            cells: HashMap::new(),
            wait_until_ms,
            lockfile: Some(lockfile),
        })
    }

    /// True while the post-crash silence period lasts.
    pub fn is_recovering(&self, now_ms: i64) -> bool {
        self.wait_until_ms >= now_ms
    }

    /// Sets the view of a cell, or invalidates it for [`VIEW_ID_INVALIDATED`].
    pub fn set_view_id(&mut self, cell_id: &CellId, view_id: i32, now_ms: i64) {
        let cell = self.cell(cell_id, now_ms);
        if view_id == VIEW_ID_INVALIDATED {
            cell.view_invalidated = true;
        } else {
            cell.view_id = view_id;
            cell.view_invalidated = false;
        }
    }

    fn cell(&mut self, cell_id: &CellId, now_ms: i64) -> &mut AcceptorCell {
        let cell_timeout = self.config.cell_timeout_ms;
        let cell = self.cells.entry(cell_id.clone()).or_default();
        if cell.last_access_ms != 0 && cell.last_access_ms + cell_timeout < now_ms {
            tracing::debug!(cell = %cell_id, "acceptor cell idle, collected");
            *cell = AcceptorCell {
                view_id: cell.view_id,
                view_invalidated: cell.view_invalidated,
                ..Default::default()
            };
        }
        cell.last_access_ms = now_ms;
        cell
    }

    /// Phase one: promise not to accept older ballots and report the accepted value.
    pub fn handle_prepare(&mut self, msg: &FleaseMessage, now_ms: i64) -> FleaseMessage {
        let debug = self.config.debug_print_messages;
        let cell = self.cell(&msg.cell_id, now_ms);

        if let Some(prepared) = cell.prepared.as_ref().filter(|p| p.after(msg)) {
            let mut reject = msg.reply(MessageKind::PrepareNack);
            reject.prev_proposal_no = prepared.proposal_no;
            reject.lease_holder = None;
            reject.lease_timeout_ms = 0;
            reject.send_timestamp_ms = now_ms;
            if debug {
                tracing::trace!(cell = %msg.cell_id, ballot = %msg.proposal_no, prepared = %prepared.proposal_no, "A prepare NACK");
            }
            return reject;
        }

        cell.prepared = Some(msg.clone());
        let mut response = msg.reply(MessageKind::PrepareAck);
        if let Some(accepted) = &cell.accepted {
            response.prev_proposal_no = accepted.proposal_no;
            response.lease_holder = accepted.lease_holder.clone();
            response.lease_timeout_ms = accepted.lease_timeout_ms;
        }
        response.send_timestamp_ms = now_ms;
        if debug {
            tracing::trace!(cell = %msg.cell_id, ballot = %msg.proposal_no, prev = %response.prev_proposal_no, "A prepare ACK");
        }
        response
    }

    /// Phase two: accept the value unless a newer ballot was promised.
    pub fn handle_accept(&mut self, msg: &FleaseMessage, now_ms: i64) -> FleaseMessage {
        let debug = self.config.debug_print_messages;
        let cell = self.cell(&msg.cell_id, now_ms);

        if let Some(prepared) = cell.prepared.as_ref().filter(|p| p.after(msg)) {
            let mut reject = msg.reply(MessageKind::AcceptNack);
            reject.prev_proposal_no = prepared.proposal_no;
            reject.lease_holder = None;
            reject.lease_timeout_ms = 0;
            reject.send_timestamp_ms = now_ms;
            if debug {
                tracing::trace!(cell = %msg.cell_id, ballot = %msg.proposal_no, prepared = %prepared.proposal_no, "A accept NACK");
            }
            return reject;
        }

        cell.accepted = Some(msg.clone());
        cell.prepared = Some(msg.clone());
        let mut response = msg.reply(MessageKind::AcceptAck);
        response.send_timestamp_ms = now_ms;
        if debug {
            tracing::trace!(cell = %msg.cell_id, ballot = %msg.proposal_no, "A accept ACK");
        }
        response
    }

    /// Records a chosen value and raises `learned_event`. Stale LEARNs are ignored.
    pub fn handle_learn<L: FleaseListener + ?Sized>(
        &mut self,
        msg: &FleaseMessage,
        now_ms: i64,
        listener: &mut L,
    ) {
        let cell = self.cell(&msg.cell_id, now_ms);
        if cell.prepared_after(msg) || cell.accepted_after(msg) {
            tracing::debug!(cell = %msg.cell_id, ballot = %msg.proposal_no, "A ignore outdated LEARN");
            return;
        }
        cell.accepted = Some(msg.clone());
        cell.prepared = Some(msg.clone());
        cell.latest_learn = Some(msg.clone());
        listener.learned_event(
            &msg.cell_id,
            msg.lease_holder.as_deref(),
            msg.lease_timeout_ms,
            msg.master_epoch,
        );
    }

    /// The last learned value for a cell, if any.
    pub fn local_lease_information(
        &mut self,
        cell_id: &CellId,
        now_ms: i64,
    ) -> Option<FleaseMessage> {
        self.cell(cell_id, now_ms).latest_learn.clone()
    }

    /// Learned value of every known cell.
    pub fn local_state(&self) -> HashMap<CellId, Option<FleaseMessage>> {
        self.cells
            .iter()
            .map(|(id, cell)| {
                let learned = cell
                    .latest_learn
                    .as_ref()
                    .and(cell.accepted.clone());
                (id.clone(), learned)
            })
            .collect()
    }

    /// Entry point for remote acceptor messages.
    ///
    /// Returns the reply to send back, or `None` when no reply is warranted.
    pub fn process_message<L: FleaseListener + ?Sized>(
        &mut self,
        msg: &FleaseMessage,
        now_ms: i64,
        listener: &mut L,
    ) -> Option<FleaseMessage> {
        if msg.send_timestamp_ms.saturating_add(self.config.message_timeout_ms) < now_ms {
            tracing::debug!(cell = %msg.cell_id, kind = ?msg.kind, "A drop outdated message");
            return None;
        }
        if self.is_recovering(now_ms) {
            tracing::debug!(cell = %msg.cell_id, "A drop message during restart wait");
            return None;
        }

        let cell = self.cell(&msg.cell_id, now_ms);
        if cell.view_id < msg.view_id {
            // Still answered; the listener decides whether to adopt the new view.
            listener.view_id_change_event(&msg.cell_id, msg.view_id, false);
        } else if cell.view_id > msg.view_id
            || (cell.view_id == msg.view_id && cell.view_invalidated)
        {
            let mut response = msg.reply(MessageKind::WrongView);
            response.view_id = cell.view_id;
            response.send_timestamp_ms = now_ms;
            return Some(response);
        }

        match msg.kind {
            MessageKind::Prepare => Some(self.handle_prepare(msg, now_ms)),
            MessageKind::Accept => Some(self.handle_accept(msg, now_ms)),
            MessageKind::Learn => {
                self.handle_learn(msg, now_ms, listener);
                None
            }
            MessageKind::PrepareAck
            | MessageKind::PrepareNack
            | MessageKind::AcceptAck
            | MessageKind::AcceptNack
            | MessageKind::WrongView
            | MessageKind::EventRestart
            | MessageKind::EventRenew
            | MessageKind::EventTimeoutPrepare
            | MessageKind::EventTimeoutAccept => {
                tracing::warn!(cell = %msg.cell_id, kind = ?msg.kind, "A unexpected message kind");
                None
            }
        }
    }

    /// Removes the lock file after a clean shutdown.
    pub fn shutdown(&mut self) {
        if let Some(lockfile) = self.lockfile.take() {
            if let Err(e) = std::fs::remove_file(&lockfile) {
                tracing::warn!(lockfile = %lockfile.display(), error = %e, "could not remove lock file");
            }
        }
    }
}
