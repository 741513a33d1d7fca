//! Latest lease of every open cell, as reported by the stage.

use std::collections::HashMap;
use std::sync::Arc;

use leasefs_flease::{CellId, Flease, FleaseError, FleaseStatusListener};
use parking_lot::Mutex;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// A lease change or an acquisition failure.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// The lease of a cell changed. Empty when no holder is known.
    Changed(Flease),
    /// Acquisition of a cell failed.
    Failed {
        /// Affected cell.
        cell_id: CellId,
        /// Failure description, including the cell's recent actions.
        reason: String,
    },
}

#[derive(Default)]
struct Inner {
    leases: HashMap<CellId, Flease>,
    failures: HashMap<CellId, u64>,
}

/// Shared table of leases. Clones see the same state.
#[derive(Clone)]
pub struct LeaseTable {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<LeaseEvent>,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// Latest lease of a cell, if any was reported.
    pub fn get(&self, cell_id: &CellId) -> Option<Flease> {
        self.inner.lock().leases.get(cell_id).cloned()
    }

    /// Latest lease of every reported cell.
    pub fn all(&self) -> Vec<Flease> {
        let mut leases: Vec<Flease> = self.inner.lock().leases.values().cloned().collect();
        leases.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        leases
    }

    /// Failed acquisitions of a cell so far.
    pub fn failures(&self, cell_id: &CellId) -> u64 {
        self.inner.lock().failures.get(cell_id).copied().unwrap_or(0)
    }

    /// Receives every later change.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: LeaseEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl FleaseStatusListener for LeaseTable {
    fn status_changed(&mut self, cell_id: &CellId, lease: &Flease) {
        if lease.is_empty() {
            tracing::info!(cell = %cell_id, "lease holder unknown");
        } else {
            tracing::info!(
                cell = %cell_id,
                holder = lease.holder.as_deref().unwrap_or_default(),
                timeout_ms = lease.lease_timeout_ms,
                master_epoch = lease.master_epoch,
                "lease changed"
            );
        }
        self.inner.lock().leases.insert(cell_id.clone(), lease.clone());
        self.publish(LeaseEvent::Changed(lease.clone()));
    }

    fn lease_failed(&mut self, cell_id: &CellId, error: &FleaseError) {
        tracing::warn!(cell = %cell_id, error = %error, "lease acquisition failed");
        *self.inner.lock().failures.entry(cell_id.clone()).or_insert(0) += 1;
        self.publish(LeaseEvent::Failed {
            cell_id: cell_id.clone(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lease(cell: &str, holder: &str) -> Flease {
        Flease::new(CellId::from(cell), Some(holder.to_string()), 1_000, 3)
    }

    #[test]
    fn test_status_changed_replaces_lease() {
        let table = LeaseTable::new();
        let mut listener = table.clone();
        let cell = CellId::from("cell-a");

        listener.status_changed(&cell, &make_lease("cell-a", "osd-1"));
        listener.status_changed(&cell, &make_lease("cell-a", "osd-2"));

        let lease = table.get(&cell).unwrap();
        assert_eq!(lease.holder.as_deref(), Some("osd-2"));
        assert_eq!(table.all().len(), 1);
    }

    #[test]
    fn test_all_sorted_by_cell() {
        let table = LeaseTable::new();
        let mut listener = table.clone();
        listener.status_changed(&CellId::from("b"), &make_lease("b", "osd-1"));
        listener.status_changed(&CellId::from("a"), &make_lease("a", "osd-1"));

        let cells: Vec<CellId> = table.all().into_iter().map(|l| l.cell_id).collect();
        assert_eq!(cells, vec![CellId::from("a"), CellId::from("b")]);
    }

    #[test]
    fn test_lease_failed_counts_and_publishes() {
        let table = LeaseTable::new();
        let mut events = table.subscribe();
        let mut listener = table.clone();
        let cell = CellId::from("cell-a");

        listener.lease_failed(&cell, &FleaseError::CellNotOpen(cell.clone()));

        assert_eq!(table.failures(&cell), 1);
        assert!(table.get(&cell).is_none());
        match events.try_recv().unwrap() {
            LeaseEvent::Failed { cell_id, .. } => assert_eq!(cell_id, cell),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
