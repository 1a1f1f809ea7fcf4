//! Checkpoint and history persistence seams.
//!
//! The engine only sees these traits. `MemoryCheckpointStore` keeps
//! snapshots in process; the collab crate's RocksDB log is the durable
//! implementation of both traits.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{DocumentState, HistoryEntry};
use crate::error::HistoryError;
use crate::DocumentId;

/// Durable `(document, version) -> DocumentState` snapshots.
pub trait CheckpointStore: Send + Sync {
    fn save_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
        state: &DocumentState,
    ) -> Result<(), HistoryError>;

    fn load_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<DocumentState>, HistoryError>;

    /// Highest-version checkpoint of the document, if any.
    fn latest_checkpoint(&self, document_id: DocumentId) -> Result<Option<DocumentState>, HistoryError>;

    /// Drop checkpoints with a version strictly above `version`.
    fn discard_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError>;
}

/// Destination of the history outbox.
pub trait HistorySink: Send + Sync {
    fn save_entries(&self, document_id: DocumentId, entries: &[HistoryEntry]) -> Result<(), HistoryError>;

    /// Drop stored entries with a version strictly above `version`.
    fn discard_entries_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError>;
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    snapshots: Mutex<BTreeMap<(DocumentId, u64), DocumentState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(DocumentId, u64), DocumentState>>, HistoryError> {
        self.snapshots
            .lock()
            .map_err(|_| HistoryError::Storage("checkpoint store lock poisoned".into()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
        state: &DocumentState,
    ) -> Result<(), HistoryError> {
        self.lock()?.insert((document_id, version), state.clone());
        Ok(())
    }

    fn load_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<DocumentState>, HistoryError> {
        Ok(self.lock()?.get(&(document_id, version)).cloned())
    }

    fn latest_checkpoint(&self, document_id: DocumentId) -> Result<Option<DocumentState>, HistoryError> {
        Ok(self
            .lock()?
            .range((document_id, 0)..=(document_id, u64::MAX))
            .next_back()
            .map(|(_, state)| state.clone()))
    }

    fn discard_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError> {
        self.lock()?
            .retain(|(doc, v), _| *doc != document_id || *v <= version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(version: u64) -> DocumentState {
        DocumentState {
            version,
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_and_discard() {
        let store = MemoryCheckpointStore::new();
        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        for v in [5, 10, 15] {
            store.save_checkpoint(doc, v, &state(v)).unwrap();
        }
        store.save_checkpoint(other, 99, &state(99)).unwrap();

        assert_eq!(store.latest_checkpoint(doc).unwrap().unwrap().version, 15);

        store.discard_after(doc, 10).unwrap();
        assert_eq!(store.latest_checkpoint(doc).unwrap().unwrap().version, 10);
        assert!(store.load_checkpoint(doc, 15).unwrap().is_none());
        assert_eq!(store.latest_checkpoint(other).unwrap().unwrap().version, 99);
    }
}
