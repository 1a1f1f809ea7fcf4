//! Authorized, validated operation persistence.
//!
//! ```text
//! Session ──► Authorizer (membership / role)
//!                 │
//!                 ▼
//! NewOperation[] ──► parse + resolve references ──► LogWriter::append (one WriteBatch)
//!                                                        │
//!                                                        └─► GeometryCache::invalidate
//! ```
//!
//! The store is the only place sequences are assigned. A batch is validated
//! in full under the writer lock before anything is written, so either every
//! item lands with contiguous sequences or nothing does.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use polygon_core::{
    DocumentId, DocumentState, HistoryEntry, NewOperation, Operation, OperationError,
    OperationId, OperationParams, OperationType, SceneState,
};
use serde_json::{Map, Value};

use crate::auth::{Authorizer, DocumentInfo, Membership, Session};
use crate::cache::GeometryCache;
use crate::storage::{CheckpointInfo, OperationLog};

/// Operation service over the RocksDB log.
pub struct OperationStore {
    log: Arc<OperationLog>,
    auth: Arc<dyn Authorizer>,
    cache: Arc<dyn GeometryCache>,
}

impl OperationStore {
    pub fn new(
        log: Arc<OperationLog>,
        auth: Arc<dyn Authorizer>,
        cache: Arc<dyn GeometryCache>,
    ) -> Self {
        Self { log, auth, cache }
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Create one operation.
    pub fn create(
        &self,
        session: &Session,
        document_id: DocumentId,
        operation: NewOperation,
    ) -> Result<Operation, OperationError> {
        let mut created = self.create_batch(session, document_id, vec![operation])?;
        created
            .pop()
            .ok_or_else(|| OperationError::storage("batch of one produced no operation"))
    }

    /// Create operations atomically, with contiguous sequences in array order.
    ///
    /// Dependencies may name live operations of the document or the
    /// `clientId` of an earlier item in the same batch.
    pub fn create_batch(
        &self,
        session: &Session,
        document_id: DocumentId,
        operations: Vec<NewOperation>,
    ) -> Result<Vec<Operation>, OperationError> {
        self.member(session, document_id)?;
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let writer = self.log.writer()?;
        let existing: HashMap<OperationId, OperationType> = self
            .log
            .live_operations(document_id)?
            .into_iter()
            .map(|op| (op.id.clone(), op.op_type()))
            .collect();
        let first_sequence = writer.next_sequence(document_id)?;

        let mut batch = BatchResolver::new(&existing);
        let mut created = Vec::with_capacity(operations.len());
        for (index, item) in operations.into_iter().enumerate() {
            let op = batch
                .resolve(item, first_sequence + index as u64)
                .map_err(|e| at_index(index, e))?;
            created.push(op);
        }

        writer.append(document_id, &created)?;
        drop(writer);

        self.cache.invalidate(document_id);
        info!(
            "Created {} operation(s) in document {} (sequences {}..={})",
            created.len(),
            document_id,
            first_sequence,
            first_sequence + created.len() as u64 - 1
        );
        Ok(created)
    }

    /// Merge `patch` into the operation's parameters. Owner or admin only.
    pub fn update(
        &self,
        session: &Session,
        operation_id: &OperationId,
        patch: &Map<String, Value>,
    ) -> Result<Operation, OperationError> {
        let writer = self.log.writer()?;
        let (document_id, mut stored) = self.live(operation_id)?;
        self.privileged(session, document_id, "update")?;

        let params = stored.operation.params.merged(patch)?;
        if let Some(reference) = params.source_reference() {
            if !stored.operation.depends_on(reference) {
                return Err(OperationError::invalid(format!(
                    "{}: referenced operation {} must be listed in dependencies",
                    params.op_type(),
                    reference
                )));
            }
            let referenced_type = match self.log.load_operation(reference)? {
                Some((doc, target)) if doc == document_id && !target.is_deleted() => {
                    target.operation.op_type()
                }
                _ => {
                    return Err(OperationError::invalid(format!(
                        "{}: referenced operation {} is not a live operation of this document",
                        params.op_type(),
                        reference
                    )))
                }
            };
            check_reference_type(&params, reference, referenced_type)?;
        }

        stored.operation.params = params;
        stored.operation.updated_at = Utc::now();
        writer.replace(document_id, &stored)?;
        drop(writer);

        self.cache.invalidate(document_id);
        debug!("Updated operation {} in document {}", operation_id, document_id);
        Ok(stored.operation)
    }

    /// Soft-delete an operation. Owner or admin only.
    ///
    /// Fails with `DependencyConflict` while live operations depend on it.
    pub fn delete(&self, session: &Session, operation_id: &OperationId) -> Result<(), OperationError> {
        let writer = self.log.writer()?;
        let (document_id, mut stored) = self.live(operation_id)?;
        self.privileged(session, document_id, "delete")?;

        let blocking: Vec<OperationId> = self
            .log
            .live_operations(document_id)?
            .into_iter()
            .filter(|op| op.depends_on(operation_id))
            .map(|op| op.id)
            .collect();
        if !blocking.is_empty() {
            return Err(OperationError::DependencyConflict {
                operation_id: operation_id.clone(),
                blocking,
            });
        }

        stored.deleted_at = Some(Utc::now());
        writer.replace(document_id, &stored)?;
        drop(writer);

        self.cache.invalidate(document_id);
        info!("Deleted operation {} in document {}", operation_id, document_id);
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Live operations in canonical replay order.
    pub fn get_by_document(
        &self,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<Vec<Operation>, OperationError> {
        self.member(session, document_id)?;
        Ok(self.log.live_operations(document_id)?)
    }

    pub fn get_by_id(
        &self,
        session: &Session,
        operation_id: &OperationId,
    ) -> Result<Operation, OperationError> {
        let (document_id, stored) = self.live(operation_id)?;
        self.member(session, document_id)?;
        Ok(stored.operation)
    }

    /// Document details, for members only.
    pub fn document(
        &self,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<DocumentInfo, OperationError> {
        self.member(session, document_id)?;
        self.auth.document(document_id)
    }

    // ─── Scenes ───────────────────────────────────────────────────────

    pub fn save_scene(
        &self,
        session: &Session,
        document_id: DocumentId,
        scene: &SceneState,
    ) -> Result<(), OperationError> {
        self.member(session, document_id)?;
        scene.validate()?;
        let meta = self.log.writer()?.save_scene(document_id, scene)?;
        debug!(
            "Saved scene for document {} ({} bytes, {} compressed)",
            document_id, meta.scene_size, meta.compressed_size
        );
        Ok(())
    }

    pub fn load_scene(
        &self,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<Option<SceneState>, OperationError> {
        self.member(session, document_id)?;
        Ok(self.log.load_scene(document_id)?)
    }

    // ─── History ──────────────────────────────────────────────────────

    pub fn save_history_entries(
        &self,
        session: &Session,
        document_id: DocumentId,
        entries: &[HistoryEntry],
    ) -> Result<(), OperationError> {
        self.member(session, document_id)?;
        self.log.append_history(document_id, entries)?;
        debug!("Saved {} history entries for document {}", entries.len(), document_id);
        Ok(())
    }

    /// History entries with `from <= version <= to`, oldest first.
    pub fn get_history(
        &self,
        session: &Session,
        document_id: DocumentId,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<HistoryEntry>, OperationError> {
        self.member(session, document_id)?;
        Ok(self.log.load_history_range(
            document_id,
            from.unwrap_or(0),
            to.unwrap_or(u64::MAX),
        )?)
    }

    /// Drop history entries above `version` after an undo/redo branch or clear.
    pub fn discard_history_after(
        &self,
        session: &Session,
        document_id: DocumentId,
        version: u64,
    ) -> Result<(), OperationError> {
        self.member(session, document_id)?;
        self.log.discard_history_after(document_id, version)?;
        Ok(())
    }

    pub fn save_checkpoint(
        &self,
        session: &Session,
        document_id: DocumentId,
        version: u64,
        state: &DocumentState,
    ) -> Result<(), OperationError> {
        self.member(session, document_id)?;
        if state.version != version {
            return Err(OperationError::invalid(format!(
                "checkpoint state is at version {}, not {}",
                state.version, version
            )));
        }
        self.log.save_checkpoint_record(document_id, state)?;
        Ok(())
    }

    pub fn get_checkpoint(
        &self,
        session: &Session,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<DocumentState>, OperationError> {
        self.member(session, document_id)?;
        Ok(self
            .log
            .load_checkpoint_record(document_id, version)?
            .map(|record| record.state))
    }

    /// Highest-version checkpoint, if the document has any.
    pub fn latest_state(
        &self,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<Option<DocumentState>, OperationError> {
        self.member(session, document_id)?;
        Ok(self
            .log
            .latest_checkpoint_record(document_id)?
            .map(|record| record.state))
    }

    pub fn list_checkpoints(
        &self,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<Vec<CheckpointInfo>, OperationError> {
        self.member(session, document_id)?;
        Ok(self.log.list_checkpoints(document_id)?)
    }

    pub fn discard_checkpoints_after(
        &self,
        session: &Session,
        document_id: DocumentId,
        version: u64,
    ) -> Result<(), OperationError> {
        self.member(session, document_id)?;
        self.log.discard_checkpoints_after(document_id, version)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn member(&self, session: &Session, document_id: DocumentId) -> Result<Membership, OperationError> {
        self.auth.membership(session.user_id, document_id)
    }

    fn privileged(
        &self,
        session: &Session,
        document_id: DocumentId,
        action: &str,
    ) -> Result<Membership, OperationError> {
        let membership = self.member(session, document_id)?;
        if !membership.role.is_privileged() {
            return Err(OperationError::forbidden(format!(
                "Only owners and admins can {action} operations"
            )));
        }
        Ok(membership)
    }

    fn live(
        &self,
        operation_id: &OperationId,
    ) -> Result<(DocumentId, crate::storage::StoredOperation), OperationError> {
        match self.log.load_operation(operation_id)? {
            Some((document_id, stored)) if !stored.is_deleted() => Ok((document_id, stored)),
            _ => Err(OperationError::not_found("Operation not found")),
        }
    }
}

/// Resolves batch items against the live log and the earlier items.
struct BatchResolver<'a> {
    existing: &'a HashMap<OperationId, OperationType>,
    /// clientId → (server id, type) for items already resolved
    earlier: HashMap<OperationId, (OperationId, OperationType)>,
}

impl<'a> BatchResolver<'a> {
    fn new(existing: &'a HashMap<OperationId, OperationType>) -> Self {
        Self {
            existing,
            earlier: HashMap::new(),
        }
    }

    fn resolve(&mut self, item: NewOperation, sequence: u64) -> Result<Operation, OperationError> {
        let mut params = OperationParams::parse(item.op_type, item.parameters)?;

        if let Some(client_id) = &item.client_id {
            if self.earlier.contains_key(client_id) || self.existing.contains_key(client_id) {
                return Err(OperationError::invalid(format!(
                    "duplicate clientId {client_id}"
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(item.dependencies.len());
        for dep in &item.dependencies {
            if item.client_id.as_ref() == Some(dep) {
                return Err(OperationError::invalid(format!(
                    "operation cannot depend on itself ({dep})"
                )));
            }
            let (id, _) = self.lookup(dep)?;
            dependencies.push(id);
        }

        if let Some(reference) = params.source_reference().cloned() {
            let (id, referenced_type) = self.lookup(&reference)?;
            if !dependencies.contains(&id) {
                return Err(OperationError::invalid(format!(
                    "{}: referenced operation {} must be listed in dependencies",
                    params.op_type(),
                    reference
                )));
            }
            check_reference_type(&params, &reference, referenced_type)?;
            params.set_source_reference(id);
        }

        let op = Operation::new(OperationId::generate(), sequence, params, dependencies);
        if let Some(client_id) = item.client_id {
            self.earlier.insert(client_id, (op.id.clone(), op.op_type()));
        }
        Ok(op)
    }

    fn lookup(&self, id: &OperationId) -> Result<(OperationId, OperationType), OperationError> {
        if let Some(resolved) = self.earlier.get(id) {
            return Ok(resolved.clone());
        }
        if let Some(op_type) = self.existing.get(id) {
            return Ok((id.clone(), *op_type));
        }
        Err(OperationError::invalid(format!(
            "dependency {id} does not name an earlier live operation of this document"
        )))
    }
}

fn at_index(index: usize, error: OperationError) -> OperationError {
    match error {
        OperationError::InvalidParameters { message } => {
            OperationError::invalid(format!("operations[{index}]: {message}"))
        }
        other => other,
    }
}

/// Extrude and revolve must consume a sketch.
fn check_reference_type(
    params: &OperationParams,
    reference: &OperationId,
    referenced_type: OperationType,
) -> Result<(), OperationError> {
    let needs_sketch = matches!(params.op_type(), OperationType::Extrude | OperationType::Revolve);
    if needs_sketch && !referenced_type.is_sketch() {
        return Err(OperationError::invalid(format!(
            "{}: {} is a {} operation, not a sketch",
            params.op_type(),
            reference,
            referenced_type
        )));
    }
    Ok(())
}
