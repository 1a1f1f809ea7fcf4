//! `HistoryEngine`: recording, undo/redo, goto and checkpoints for one
//! document session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::action::ActionDraft;
use super::apply::{apply_action, revert_action, Inverse};
use super::checkpoint::{CheckpointStore, HistorySink};
use super::{DocumentState, HistoryEntry, HistoryOptions, HistoryState};
use crate::error::HistoryError;
use crate::{DocumentId, UserId};

pub struct HistoryEngine {
    document_id: DocumentId,
    user_id: UserId,
    options: HistoryOptions,
    checkpoints: Arc<dyn CheckpointStore>,
    history: HistoryState,
    state: DocumentState,
    /// State at `floor`; every entry has a version above it.
    base: DocumentState,
    inverses: HashMap<Uuid, Inverse>,
    outbox: Vec<HistoryEntry>,
    /// Durable entries above this version are stale; dropped at the next sync.
    truncate_after: Option<u64>,
}

impl HistoryEngine {
    /// Fresh history starting from the empty version-0 state.
    pub fn new(
        document_id: DocumentId,
        user_id: UserId,
        options: HistoryOptions,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self::with_base(document_id, user_id, options, checkpoints, DocumentState::default())
    }

    /// Resume from the latest durable checkpoint of the document.
    pub fn resume(
        document_id: DocumentId,
        user_id: UserId,
        options: HistoryOptions,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, HistoryError> {
        let base = checkpoints.latest_checkpoint(document_id)?.unwrap_or_default();
        info!(
            "Resuming history for document {} at version {}",
            document_id, base.version
        );
        // Entries synced past the checkpoint cannot be replayed from here.
        let version = base.version;
        let mut engine = Self::with_base(document_id, user_id, options, checkpoints, base);
        engine.truncate_after = Some(version);
        Ok(engine)
    }

    fn with_base(
        document_id: DocumentId,
        user_id: UserId,
        options: HistoryOptions,
        checkpoints: Arc<dyn CheckpointStore>,
        base: DocumentState,
    ) -> Self {
        let history = HistoryState {
            current_version: base.version,
            ..HistoryState::default()
        };
        Self {
            document_id,
            user_id,
            options,
            checkpoints,
            history,
            state: base.clone(),
            base,
            inverses: HashMap::new(),
            outbox: Vec::new(),
            truncate_after: None,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn history_state(&self) -> &HistoryState {
        &self.history
    }

    pub fn options(&self) -> &HistoryOptions {
        &self.options
    }

    pub fn current_version(&self) -> u64 {
        self.history.current_version
    }

    /// Highest recorded version (the top of the redo stack, if any).
    pub fn max_version(&self) -> u64 {
        self.history
            .entries
            .last()
            .map(|e| e.version)
            .unwrap_or(self.base.version)
    }

    /// Oldest reachable version.
    pub fn floor_version(&self) -> u64 {
        self.base.version
    }

    pub fn can_undo(&self) -> bool {
        !self.history.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.history.redo_stack.is_empty()
    }

    pub fn pending_sync(&self) -> usize {
        self.outbox.len()
    }

    pub fn pause_recording(&mut self) {
        self.history.is_recording = false;
    }

    pub fn resume_recording(&mut self) {
        self.history.is_recording = true;
    }

    fn entry_for_action(&self, action_id: Uuid) -> Option<&HistoryEntry> {
        self.history.entries.iter().find(|e| e.action.id == action_id)
    }

    // ─── Recording ───────────────────────────────────────────────────

    /// Apply and record a new action. Returns the new version, or `None`
    /// while recording is paused.
    pub fn record_action(&mut self, draft: ActionDraft) -> Option<u64> {
        if !self.history.is_recording {
            return None;
        }

        let current = self.history.current_version;
        let superseded = self.history.entries.iter().any(|e| e.version > current);
        if superseded {
            self.drop_superseded(current);
        }

        let action = draft.into_action(Uuid::new_v4(), Utc::now().timestamp_millis(), self.user_id);
        let inverse = Inverse::capture(&self.state, &action);
        let version = current + 1;

        let mut next = apply_action(std::mem::take(&mut self.state), &action);
        next.version = version;
        self.state = next;

        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            document_id: self.document_id,
            user_id: self.user_id,
            version,
            action,
            branch_id: self.history.current_branch,
            is_checkpoint: self.is_checkpoint_version(version),
        };

        self.inverses.insert(entry.action.id, inverse);
        self.history.undo_stack.push(entry.action.id);
        self.history.redo_stack.clear();
        self.history.current_version = version;
        self.history.entries.push(entry.clone());

        if entry.is_checkpoint {
            match self.checkpoints.save_checkpoint(self.document_id, version, &self.state) {
                Ok(()) => self.list_checkpoint(version),
                Err(e) => warn!(
                    "Checkpoint at version {} for document {} not persisted: {}",
                    version, self.document_id, e
                ),
            }
        }

        self.trim();
        self.outbox.push(entry);
        debug!("Recorded version {} for document {}", version, self.document_id);
        Some(version)
    }

    fn is_checkpoint_version(&self, version: u64) -> bool {
        self.options.checkpoint_interval > 0 && version % self.options.checkpoint_interval == 0
    }

    fn list_checkpoint(&mut self, version: u64) {
        if let Err(pos) = self.history.checkpoints.binary_search(&version) {
            self.history.checkpoints.insert(pos, version);
        }
    }

    /// Forget entries above `current` (the redo branch a new action replaces).
    fn drop_superseded(&mut self, current: u64) {
        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.history.entries)
            .into_iter()
            .partition(|e| e.version <= current);
        for entry in &dropped {
            self.inverses.remove(&entry.action.id);
        }
        self.history.entries = kept;
        self.history.checkpoints.retain(|&v| v <= current);
        self.outbox.retain(|e| e.version <= current);
        if !dropped.is_empty() {
            self.truncate_after = Some(self.truncate_after.map_or(current, |v| v.min(current)));
        }
        if let Err(e) = self.checkpoints.discard_after(self.document_id, current) {
            warn!(
                "Failed to discard checkpoints above {} for document {}: {}",
                current, self.document_id, e
            );
        }
    }

    /// Fold the oldest entries into the base once the undo stack overflows.
    fn trim(&mut self) {
        let overflow = self
            .history
            .undo_stack
            .len()
            .saturating_sub(self.options.max_undo_levels);
        if overflow == 0 {
            return;
        }

        let dropped: Vec<HistoryEntry> = self.history.entries.drain(..overflow).collect();
        let mut base = std::mem::take(&mut self.base);
        for entry in &dropped {
            base = apply_action(base, &entry.action);
            base.version = entry.version;
            self.inverses.remove(&entry.action.id);
        }
        self.base = base;
        self.history.undo_stack.drain(..overflow);

        let floor = self.base.version;
        self.history.checkpoints.retain(|&v| v > floor);
        debug!("Trimmed history for document {} to floor {}", self.document_id, floor);
    }

    // ─── Navigation ──────────────────────────────────────────────────

    /// Step back one version. Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(&action_id) = self.history.undo_stack.last() else {
            return false;
        };
        let Some(inverse) = self.inverses.get(&action_id) else {
            warn!("Missing inverse for action {}", action_id);
            return false;
        };

        let mut next = revert_action(std::mem::take(&mut self.state), inverse);
        next.version = self.history.current_version - 1;
        self.state = next;

        self.history.undo_stack.pop();
        self.history.redo_stack.push(action_id);
        self.history.current_version -= 1;
        true
    }

    /// Re-apply the most recently undone action.
    pub fn redo(&mut self) -> bool {
        let Some(&action_id) = self.history.redo_stack.last() else {
            return false;
        };
        let Some(entry) = self.entry_for_action(action_id) else {
            warn!("Missing history entry for action {}", action_id);
            return false;
        };
        let version = entry.version;
        let action = entry.action.clone();

        let mut next = apply_action(std::mem::take(&mut self.state), &action);
        next.version = version;
        self.state = next;

        self.history.redo_stack.pop();
        self.history.undo_stack.push(action_id);
        self.history.current_version = version;
        true
    }

    /// Jump to `version` by replaying from the nearest checkpoint.
    ///
    /// `Ok(false)` for the current version or one above the maximum.
    /// Below the trimmed floor the version is unreachable.
    pub fn goto(&mut self, version: u64) -> Result<bool, HistoryError> {
        if version == self.history.current_version || version > self.max_version() {
            return Ok(false);
        }
        let floor = self.floor_version();
        if version < floor {
            return Err(HistoryError::ReplayGap {
                requested: version,
                floor,
            });
        }

        let mut state = self.replay_start(version);
        let start = state.version;
        for entry in self
            .history
            .entries
            .iter()
            .filter(|e| e.version > start && e.version <= version)
        {
            state = apply_action(state, &entry.action);
        }
        state.version = version;

        self.state = state;
        self.history.current_version = version;
        self.history.undo_stack = self
            .history
            .entries
            .iter()
            .filter(|e| e.version <= version)
            .map(|e| e.action.id)
            .collect();
        self.history.redo_stack = self
            .history
            .entries
            .iter()
            .rev()
            .filter(|e| e.version > version)
            .map(|e| e.action.id)
            .collect();
        debug!("Moved document {} to version {}", self.document_id, version);
        Ok(true)
    }

    /// Nearest loadable listed checkpoint in `(floor, version]`, else the base.
    fn replay_start(&self, version: u64) -> DocumentState {
        let floor = self.floor_version();
        let nearest = self
            .history
            .checkpoints
            .iter()
            .rev()
            .copied()
            .find(|&c| c > floor && c <= version);

        if let Some(c) = nearest {
            match self.checkpoints.load_checkpoint(self.document_id, c) {
                Ok(Some(mut state)) => {
                    state.version = c;
                    return state;
                }
                Ok(None) => warn!(
                    "Checkpoint {} for document {} is listed but missing; replaying from {}",
                    c, self.document_id, floor
                ),
                Err(e) => warn!(
                    "Failed to load checkpoint {} for document {}: {}; replaying from {}",
                    c, self.document_id, e, floor
                ),
            }
        }
        self.base.clone()
    }

    // ─── Checkpoints ─────────────────────────────────────────────────

    /// Persist the current state and list its version.
    pub fn create_checkpoint(&mut self) -> Result<(), HistoryError> {
        let version = self.history.current_version;
        self.checkpoints
            .save_checkpoint(self.document_id, version, &self.state)?;
        self.list_checkpoint(version);
        info!("Checkpoint created for document {} at version {}", self.document_id, version);
        Ok(())
    }

    /// Stored checkpoint for a listed version.
    pub fn load_checkpoint(&self, version: u64) -> Result<DocumentState, HistoryError> {
        self.checkpoints
            .load_checkpoint(self.document_id, version)?
            .ok_or(HistoryError::NotFound { version })
    }

    // ─── Inspection / maintenance ────────────────────────────────────

    /// Entries with `from <= version <= to` (defaults: 0 and the current version).
    pub fn get_history(&self, from: Option<u64>, to: Option<u64>) -> Vec<&HistoryEntry> {
        let from = from.unwrap_or(0);
        let to = to.unwrap_or(self.history.current_version);
        self.history
            .entries
            .iter()
            .filter(|e| e.version >= from && e.version <= to)
            .collect()
    }

    /// Make the current state the version-0 base and forget everything else.
    pub fn clear_history(&mut self) {
        let mut base = self.state.clone();
        base.version = 0;
        self.state = base.clone();
        self.base = base;
        let is_recording = self.history.is_recording;
        self.history = HistoryState {
            is_recording,
            ..HistoryState::default()
        };
        self.inverses.clear();
        self.outbox.clear();
        self.truncate_after = Some(0);
        if let Err(e) = self.checkpoints.discard_after(self.document_id, 0) {
            warn!("Failed to discard checkpoints for document {}: {}", self.document_id, e);
        }
        info!("History cleared for document {}", self.document_id);
    }

    /// Drain the sync outbox into `sink`. Entries return to the outbox on failure.
    ///
    /// Superseded entries the sink already holds are discarded first.
    pub fn sync_pending(&mut self, sink: &dyn HistorySink) -> Result<usize, HistoryError> {
        if let Some(version) = self.truncate_after {
            sink.discard_entries_after(self.document_id, version)?;
            self.truncate_after = None;
        }
        if self.outbox.is_empty() {
            return Ok(0);
        }
        let entries = std::mem::take(&mut self.outbox);
        self.history.is_syncing = true;
        let result = sink.save_entries(self.document_id, &entries);
        self.history.is_syncing = false;

        match result {
            Ok(()) => {
                debug!("Synced {} history entries for document {}", entries.len(), self.document_id);
                Ok(entries.len())
            }
            Err(e) => {
                let mut restored = entries;
                restored.append(&mut self.outbox);
                self.outbox = restored;
                Err(e)
            }
        }
    }
}
