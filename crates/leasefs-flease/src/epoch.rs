//! Master epoch stores.
//!
//! An acceptor hands out the highest master epoch it has stored for a cell
//! when a PREPARE asks for it, and stores the epoch carried by an ACCEPT
//! before acknowledging it. A store that fails to persist never finishes the
//! completion, so the reply is withheld and the proposer's round times out.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::comm::{EpochCompletion, MasterEpochHandler};
use crate::error::{FleaseError, Result};
use crate::types::{CellId, REQUEST_MASTER_EPOCH};

/// Epochs kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    epochs: HashMap<CellId, i64>,
}

impl MemoryEpochStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored epoch of a cell, [`REQUEST_MASTER_EPOCH`] if none.
    pub fn epoch(&self, cell_id: &CellId) -> i64 {
        self.epochs
            .get(cell_id)
            .copied()
            .unwrap_or(REQUEST_MASTER_EPOCH)
    }
}

impl MasterEpochHandler for MemoryEpochStore {
    fn send_master_epoch(&mut self, mut completion: EpochCompletion) {
        let epoch = self.epoch(&completion.message().cell_id);
        completion.message_mut().master_epoch = epoch;
        completion.finish();
    }

    fn store_master_epoch(&mut self, completion: EpochCompletion) {
        let msg = completion.message();
        let stored = self.epochs.entry(msg.cell_id.clone()).or_insert(0);
        *stored = (*stored).max(msg.master_epoch);
        completion.finish();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EpochRecord {
    cell: CellId,
    epoch: i64,
}

/// Epochs persisted as JSON, rewritten through a temporary file and rename.
#[derive(Debug)]
pub struct FileEpochStore {
    path: PathBuf,
    cache: MemoryEpochStore,
}

impl FileEpochStore {
    /// Opens (or starts) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut cache = MemoryEpochStore::new();
        if path.exists() {
            let data = fs::read(&path)?;
            let records: Vec<EpochRecord> = serde_json::from_slice(&data).map_err(|e| {
                FleaseError::Io(format!(
                    "corrupt epoch file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            for record in records {
                cache.epochs.insert(record.cell, record.epoch);
            }
            tracing::info!(path = %path.display(), cells = cache.epochs.len(), "loaded master epochs");
        }
        Ok(Self { path, cache })
    }

    /// Location of the epoch file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored epoch of a cell, [`REQUEST_MASTER_EPOCH`] if none.
    pub fn epoch(&self, cell_id: &CellId) -> i64 {
        self.cache.epoch(cell_id)
    }

    fn persist(&self) -> Result<()> {
        let mut records: Vec<EpochRecord> = self
            .cache
            .epochs
            .iter()
            .map(|(cell, epoch)| EpochRecord {
                cell: cell.clone(),
                epoch: *epoch,
            })
            .collect();
        records.sort_by(|a, b| a.cell.cmp(&b.cell));
        let data = serde_json::to_vec_pretty(&records)
            .map_err(|e| FleaseError::Io(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MasterEpochHandler for FileEpochStore {
    fn send_master_epoch(&mut self, completion: EpochCompletion) {
        self.cache.send_master_epoch(completion);
    }

    fn store_master_epoch(&mut self, completion: EpochCompletion) {
        let msg = completion.message();
        let previous = self.cache.epoch(&msg.cell_id);
        if msg.master_epoch <= previous {
            completion.finish();
            return;
        }
        self.cache
            .epochs
            .insert(msg.cell_id.clone(), msg.master_epoch);
        match self.persist() {
            Ok(()) => completion.finish(),
            Err(e) => {
                tracing::error!(
                    cell = %msg.cell_id,
                    epoch = msg.master_epoch,
                    error = %e,
                    "could not persist master epoch, reply withheld"
                );
                self.cache.epochs.insert(msg.cell_id.clone(), previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{EpochPipeline, PipelineStage};
    use crate::types::{FleaseMessage, MessageKind};
    use tokio::sync::mpsc;

    fn make_ack(kind: MessageKind, epoch: i64) -> FleaseMessage {
        let mut msg = FleaseMessage::new(kind, CellId::from("cell"));
        msg.master_epoch = epoch;
        msg
    }

    #[test]
    fn test_memory_store_returns_stored_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = EpochPipeline::new(Box::new(MemoryEpochStore::new()), tx);
        pipeline.send_master_epoch(
            make_ack(MessageKind::PrepareAck, REQUEST_MASTER_EPOCH),
            PipelineStage::ProposerResponse,
        );
        assert_eq!(rx.try_recv().unwrap().message.master_epoch, 0);

        pipeline.store_master_epoch(
            make_ack(MessageKind::AcceptAck, 3),
            PipelineStage::ProposerResponse,
        );
        rx.try_recv().unwrap();
        pipeline.send_master_epoch(
            make_ack(MessageKind::PrepareAck, REQUEST_MASTER_EPOCH),
            PipelineStage::ProposerResponse,
        );
        assert_eq!(rx.try_recv().unwrap().message.master_epoch, 3);
    }

    #[test]
    fn test_memory_store_never_lowers_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut store = MemoryEpochStore::new();
        store.epochs.insert(CellId::from("cell"), 7);
        let mut pipeline = EpochPipeline::new(Box::new(store), tx);
        pipeline.store_master_epoch(
            make_ack(MessageKind::AcceptAck, 2),
            PipelineStage::ProposerResponse,
        );
        rx.try_recv().unwrap();
        pipeline.send_master_epoch(
            make_ack(MessageKind::PrepareAck, REQUEST_MASTER_EPOCH),
            PipelineStage::ProposerResponse,
        );
        assert_eq!(rx.try_recv().unwrap().message.master_epoch, 7);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs.json");
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let store = FileEpochStore::open(&path).unwrap();
            let mut pipeline = EpochPipeline::new(Box::new(store), tx.clone());
            pipeline.store_master_epoch(
                make_ack(MessageKind::AcceptAck, 5),
                PipelineStage::ProposerResponse,
            );
            assert_eq!(rx.try_recv().unwrap().message.master_epoch, 5);
        }
        let reopened = FileEpochStore::open(&path).unwrap();
        assert_eq!(reopened.epoch(&CellId::from("cell")), 5);
        assert_eq!(reopened.epoch(&CellId::from("other")), REQUEST_MASTER_EPOCH);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(FileEpochStore::open(&path).is_err());
    }
}
