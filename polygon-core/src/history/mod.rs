//! Per-session linear undo/redo history with durable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//!   ActionDraft ──record_action──▶ apply_action(state) ──▶ DocumentState(v+1)
//!                                     │
//!                                     ├─ Inverse captured from the pre-state
//!                                     ├─ HistoryEntry appended, undo stack pushed
//!                                     └─ every N versions: CheckpointStore::save
//!
//!   undo: revert_action(state, inverse)        v → v-1
//!   redo: apply_action(state, action)          v → v+1
//!   goto: nearest checkpoint c ≤ v (or base) + fold (c, v]
//! ```
//!
//! Memory is bounded by the action log plus one inverse per entry. Only the
//! base snapshot (the floor below which history was trimmed) is kept whole.
//!
//! Undo is personal: each collaborator has an independent engine over the
//! shared operation log.

mod action;
mod apply;
mod checkpoint;
mod engine;
pub mod state;

pub use action::{
    ActionDraft, ActionKind, ActionSubtype, ActionType, AnnotationAction, AppearanceAction,
    AssemblyAction, DocumentAction, HistoryAction, SketchAction, SolidAction,
};
pub use apply::{apply_action, revert_action, Collection, Inverse, SlotValue};
pub use checkpoint::{CheckpointStore, HistorySink, MemoryCheckpointStore};
pub use engine::HistoryEngine;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{DocumentId, UserId};

/// Materialized document state at one version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub version: u64,
    #[serde(default)]
    pub sketches: BTreeMap<String, Value>,
    #[serde(default)]
    pub objects: BTreeMap<String, Value>,
    #[serde(default)]
    pub materials: BTreeMap<String, Value>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: StateMetadata,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    /// Unix milliseconds of the last applied action.
    pub last_modified: i64,
    pub last_modified_by: Option<UserId>,
}

/// Audit record of one action applied at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub version: u64,
    pub action: HistoryAction,
    /// Reserved for non-linear history; always `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<Uuid>,
    pub is_checkpoint: bool,
}

/// Inspectable history bookkeeping for one document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    pub entries: Vec<HistoryEntry>,
    pub current_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<Uuid>,
    /// Action ids, oldest first; the top is the next undo.
    pub undo_stack: Vec<Uuid>,
    /// Action ids; the top is the next redo.
    pub redo_stack: Vec<Uuid>,
    /// Versions with a durable checkpoint, ascending.
    pub checkpoints: Vec<u64>,
    pub is_recording: bool,
    pub is_syncing: bool,
}

impl Default for HistoryState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            current_version: 0,
            current_branch: None,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            checkpoints: Vec::new(),
            is_recording: true,
            is_syncing: false,
        }
    }
}

/// History tuning.
#[derive(Debug, Clone)]
pub struct HistoryOptions {
    /// Undo depth; older entries are folded into the base snapshot.
    pub max_undo_levels: usize,
    /// A checkpoint is persisted every `checkpoint_interval` versions (0 disables).
    pub checkpoint_interval: u64,
    /// Period of the background outbox flush.
    pub sync_interval: Duration,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_undo_levels: 100,
            checkpoint_interval: 10,
            sync_interval: Duration::from_millis(5000),
        }
    }
}

impl HistoryOptions {
    /// Small limits so tests exercise trimming and checkpoints quickly.
    pub fn for_testing() -> Self {
        Self {
            max_undo_levels: 20,
            checkpoint_interval: 5,
            sync_interval: Duration::from_millis(50),
        }
    }
}
