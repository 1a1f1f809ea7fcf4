//! Per-document sync bridge between optimistic local edits, the operation
//! store, and collaborators.
//!
//! ```text
//!   stage() ──► pending ──(autosave debounce)──► create_batch ──► saved
//!                  │                                   │
//!                  │                                   └─► OperationsSaved
//!                  └──(state debounce)──► document:state:update + save_scene
//!
//!   remote state ──► parse/validate ──► [applying_external] ──► echo baseline
//! ```
//!
//! Two debounce tasks run per mounted document. Each waits for a poke,
//! restarts its window on every further poke, then reads the latest state
//! under the lock at fire time. Sync failures never reach the editing user:
//! pending operations stay queued and the autosave timer is re-armed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use polygon_core::{
    derive_extruded_shapes, derive_sketches, migrate_scene, DocumentId, ExtrudedShape, NewOperation,
    Operation, OperationError, OperationId, OperationParams, SceneState,
};
use polygon_core::scene::PlaneSketches;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::auth::Session;
use crate::protocol::ProtocolError;
use crate::store::OperationStore;

// ─── Errors ───────────────────────────────────────────────────────────

/// Bridge errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Transient transport or persistence failure; retried by the bridge.
    SyncFailure(String),
    /// The store refused the request.
    Rejected(OperationError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::SyncFailure(e) => write!(f, "Sync failure: {e}"),
            SyncError::Rejected(e) => write!(f, "Rejected: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<OperationError> for SyncError {
    fn from(e: OperationError) -> Self {
        SyncError::Rejected(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::SyncFailure(e.to_string())
    }
}

// ─── Collaborators ────────────────────────────────────────────────────

/// Persistence the bridge talks to.
pub trait OperationBackend: Send + Sync + 'static {
    fn load_operations(
        &self,
        document_id: DocumentId,
    ) -> impl Future<Output = Result<Vec<Operation>, SyncError>> + Send;

    fn create_batch(
        &self,
        document_id: DocumentId,
        operations: Vec<NewOperation>,
    ) -> impl Future<Output = Result<Vec<Operation>, SyncError>> + Send;

    fn load_scene(
        &self,
        document_id: DocumentId,
    ) -> impl Future<Output = Result<Option<SceneState>, SyncError>> + Send;

    fn save_scene(
        &self,
        document_id: DocumentId,
        scene: SceneState,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Realtime channel to collaborators.
pub trait StateTransport: Send + Sync + 'static {
    fn emit(&self, event: OutboundEvent) -> impl Future<Output = Result<(), SyncError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// `document:state:update`
    StateUpdate {
        document_id: DocumentId,
        scene: SceneState,
    },
    /// `document:operations:saved`
    OperationsSaved {
        document_id: DocumentId,
        operations: Vec<Operation>,
    },
}

impl OutboundEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundEvent::StateUpdate { .. } => "document:state:update",
            OutboundEvent::OperationsSaved { .. } => "document:operations:saved",
        }
    }
}

/// In-process backend over an [`OperationStore`].
#[derive(Clone)]
pub struct LocalBackend {
    store: Arc<OperationStore>,
    session: Session,
}

impl LocalBackend {
    pub fn new(store: Arc<OperationStore>, session: Session) -> Self {
        Self { store, session }
    }
}

impl OperationBackend for LocalBackend {
    async fn load_operations(&self, document_id: DocumentId) -> Result<Vec<Operation>, SyncError> {
        Ok(self.store.get_by_document(&self.session, document_id)?)
    }

    async fn create_batch(
        &self,
        document_id: DocumentId,
        operations: Vec<NewOperation>,
    ) -> Result<Vec<Operation>, SyncError> {
        Ok(self.store.create_batch(&self.session, document_id, operations)?)
    }

    async fn load_scene(&self, document_id: DocumentId) -> Result<Option<SceneState>, SyncError> {
        Ok(self.store.load_scene(&self.session, document_id)?)
    }

    async fn save_scene(&self, document_id: DocumentId, scene: SceneState) -> Result<(), SyncError> {
        Ok(self.store.save_scene(&self.session, document_id, &scene)?)
    }
}

// ─── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Quiescence window before the scene is broadcast and persisted
    pub state_debounce: Duration,
    /// Quiescence window before pending operations are saved
    pub autosave_debounce: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            state_debounce: Duration::from_millis(500),
            autosave_debounce: Duration::from_millis(5000),
        }
    }
}

impl BridgeConfig {
    pub fn for_testing() -> Self {
        Self {
            state_debounce: Duration::from_millis(10),
            autosave_debounce: Duration::from_millis(50),
        }
    }
}

// ─── Stats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub batches_saved: u64,
    pub operations_saved: u64,
    pub save_failures: u64,
    /// Autosave fires that found nothing new to send
    pub saves_skipped: u64,
    pub state_broadcasts: u64,
    pub remote_applied: u64,
    pub remote_rejected: u64,
}

#[derive(Default)]
struct AtomicBridgeStats {
    batches_saved: AtomicU64,
    operations_saved: AtomicU64,
    save_failures: AtomicU64,
    saves_skipped: AtomicU64,
    state_broadcasts: AtomicU64,
    remote_applied: AtomicU64,
    remote_rejected: AtomicU64,
}

impl AtomicBridgeStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            batches_saved: self.batches_saved.load(Ordering::Relaxed),
            operations_saved: self.operations_saved.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            saves_skipped: self.saves_skipped.load(Ordering::Relaxed),
            state_broadcasts: self.state_broadcasts.load(Ordering::Relaxed),
            remote_applied: self.remote_applied.load(Ordering::Relaxed),
            remote_rejected: self.remote_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Result of one autosave attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing pending, or the payload was already synced or in flight
    Skipped,
    /// Batch accepted; the confirmed operations
    Saved(Vec<Operation>),
    /// The bridge was unmounted while the call was in flight
    Discarded,
}

// ─── Bridge ───────────────────────────────────────────────────────────

/// Mutable per-document state; only touched under the lock.
#[derive(Default)]
struct BridgeState {
    saved: Vec<Operation>,
    pending: Vec<Operation>,
    /// Client-only scene of a document with no stored operations
    legacy_scene: SceneState,
    using_database: bool,
    applying_external: bool,
    /// Autosave payload last accepted by the store
    last_synced: Option<Vec<u8>>,
    /// A batch is awaiting the store; at most one per bridge
    in_flight: bool,
    /// Scene serialization last broadcast or received (echo baseline)
    last_applied: Option<Vec<u8>>,
}

impl BridgeState {
    fn scene(&self) -> SceneState {
        if self.using_database {
            SceneState::from_operations(&self.all_operations())
        } else {
            self.legacy_scene.clone()
        }
    }

    fn all_operations(&self) -> Vec<Operation> {
        self.saved.iter().chain(self.pending.iter()).cloned().collect()
    }

    fn next_sequence(&self) -> u64 {
        self.saved
            .iter()
            .chain(self.pending.iter())
            .map(|op| op.sequence + 1)
            .max()
            .unwrap_or(0)
    }

    fn refresh_baseline(&mut self) {
        self.last_applied = self.scene().to_json().ok();
    }
}

struct Shared<B, T> {
    document_id: DocumentId,
    backend: B,
    transport: T,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    state_poke: Notify,
    autosave_poke: Notify,
    closed: AtomicBool,
    stats: AtomicBridgeStats,
}

/// Sync bridge for one mounted document.
///
/// Dropping the bridge unmounts it: both timers stop, and calls already in
/// flight complete with their results discarded.
pub struct SyncBridge<B: OperationBackend, T: StateTransport> {
    shared: Arc<Shared<B, T>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: OperationBackend, T: StateTransport> SyncBridge<B, T> {
    /// Load the document's operations once and start both timers.
    pub async fn mount(
        document_id: DocumentId,
        backend: B,
        transport: T,
        config: BridgeConfig,
    ) -> Result<Self, SyncError> {
        let saved = backend
            .load_operations(document_id)
            .await
            .map_err(|e| SyncError::SyncFailure(format!("initial load failed: {e}")))?;

        let using_database = !saved.is_empty();
        let legacy_scene = if using_database {
            SceneState::default()
        } else {
            backend
                .load_scene(document_id)
                .await
                .map_err(|e| SyncError::SyncFailure(format!("scene load failed: {e}")))?
                .unwrap_or_default()
        };

        let mut state = BridgeState {
            saved,
            legacy_scene,
            using_database,
            ..BridgeState::default()
        };
        state.refresh_baseline();

        info!(
            "Mounted document {} ({} saved operations, {} mode)",
            document_id,
            state.saved.len(),
            if using_database { "database" } else { "legacy" }
        );

        let shared = Arc::new(Shared {
            document_id,
            backend,
            transport,
            config,
            state: Mutex::new(state),
            state_poke: Notify::new(),
            autosave_poke: Notify::new(),
            closed: AtomicBool::new(false),
            stats: AtomicBridgeStats::default(),
        });

        let tasks = vec![
            tokio::spawn(Self::state_loop(shared.clone())),
            tokio::spawn(Self::autosave_loop(shared.clone())),
        ];

        Ok(Self { shared, tasks })
    }

    // ─── Local edits ─────────────────────────────────────────────────

    /// Add an optimistic operation and return its client id.
    ///
    /// The parameter reference, if any, is added to `dependencies`.
    pub async fn stage(&self, params: OperationParams, mut dependencies: Vec<OperationId>) -> OperationId {
        if let Some(reference) = params.source_reference() {
            if !dependencies.contains(reference) {
                dependencies.push(reference.clone());
            }
        }

        let id = OperationId::client_generated();
        {
            let mut state = self.shared.state.lock().await;
            let sequence = state.next_sequence();
            state
                .pending
                .push(Operation::new(id.clone(), sequence, params, dependencies));
            state.using_database = true;
        }
        debug!("Staged operation {} in document {}", id, self.shared.document_id);
        self.poke_both();
        id
    }

    /// Replace the whole pending set.
    pub async fn replace_pending(&self, operations: Vec<Operation>) {
        {
            let mut state = self.shared.state.lock().await;
            if !operations.is_empty() {
                state.using_database = true;
            }
            state.pending = operations;
        }
        self.poke_both();
    }

    /// Save pending operations now, bypassing the debounce window.
    pub async fn flush(&self) -> Result<FlushOutcome, SyncError> {
        Self::autosave(&self.shared).await
    }

    /// Move a legacy client-only scene into the operation log.
    ///
    /// Returns the number of operations created (0 if nothing to migrate).
    pub async fn migrate_legacy(&self) -> Result<usize, SyncError> {
        let batch = {
            let state = self.shared.state.lock().await;
            if state.using_database || state.legacy_scene.is_empty() {
                return Ok(0);
            }
            migrate_scene(&state.legacy_scene)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let confirmed = self
            .shared
            .backend
            .create_batch(self.shared.document_id, batch)
            .await?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(0);
        }

        let count = confirmed.len();
        {
            let mut state = self.shared.state.lock().await;
            state.saved.extend(confirmed);
            state.saved.sort_by_key(|op| op.sequence);
            state.using_database = true;
            state.legacy_scene = SceneState::default();
            state.refresh_baseline();
        }
        info!(
            "Migrated legacy scene of document {} into {} operations",
            self.shared.document_id, count
        );
        Ok(count)
    }

    // ─── Remote events ───────────────────────────────────────────────

    /// Apply a collaborator's scene (`document:state:updated`).
    ///
    /// Invalid payloads are logged and ignored. Returns whether it applied.
    pub async fn apply_remote_state(&self, payload: &[u8]) -> bool {
        let scene = match SceneState::parse(payload) {
            Ok(scene) => scene,
            Err(e) => {
                warn!(
                    "Ignoring invalid remote state for document {}: {e}",
                    self.shared.document_id
                );
                AtomicBridgeStats::bump(&self.shared.stats.remote_rejected, 1);
                return false;
            }
        };

        let mut state = self.shared.state.lock().await;
        state.applying_external = true;
        if !state.using_database {
            state.legacy_scene = scene;
        }
        // Database mode derives the scene from operations; only the
        // baseline moves so the received state is not sent back.
        state.refresh_baseline();
        state.applying_external = false;
        drop(state);

        AtomicBridgeStats::bump(&self.shared.stats.remote_applied, 1);
        true
    }

    /// Apply the persisted scene delivered on join (`document:state:hydrated`).
    pub async fn hydrate(&self, payload: &[u8]) -> bool {
        self.apply_remote_state(payload).await
    }

    /// Upsert operations a collaborator saved (`document:operations:saved`).
    pub async fn merge_remote_operations(&self, operations: Vec<Operation>) {
        if operations.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().await;
        state.applying_external = true;
        for op in operations {
            match state.saved.iter_mut().find(|saved| saved.id == op.id) {
                Some(existing) => *existing = op,
                None => state.saved.push(op),
            }
        }
        state.saved.sort_by_key(|op| op.sequence);
        state.using_database = true;
        state.refresh_baseline();
        state.applying_external = false;
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn document_id(&self) -> DocumentId {
        self.shared.document_id
    }

    /// Saved operations followed by pending ones.
    pub async fn operations(&self) -> Vec<Operation> {
        self.shared.state.lock().await.all_operations()
    }

    pub async fn sketches(&self) -> PlaneSketches {
        derive_sketches(&self.operations().await)
    }

    pub async fn extruded_shapes(&self) -> Vec<ExtrudedShape> {
        derive_extruded_shapes(&self.operations().await)
    }

    pub async fn scene(&self) -> SceneState {
        self.shared.state.lock().await.scene()
    }

    pub async fn is_using_database(&self) -> bool {
        self.shared.state.lock().await.using_database
    }

    pub async fn has_unsaved_changes(&self) -> bool {
        !self.shared.state.lock().await.pending.is_empty()
    }

    pub async fn is_applying_external_state(&self) -> bool {
        self.shared.state.lock().await.applying_external
    }

    pub fn stats(&self) -> BridgeStats {
        self.shared.stats.snapshot()
    }

    // ─── Timers ──────────────────────────────────────────────────────

    fn poke_both(&self) {
        self.shared.state_poke.notify_one();
        self.shared.autosave_poke.notify_one();
    }

    /// Wait for a poke, then for `window` of quiet. False once unmounted.
    async fn debounce(shared: &Shared<B, T>, poke: &Notify, window: Duration) -> bool {
        poke.notified().await;
        loop {
            if shared.closed.load(Ordering::Acquire) {
                return false;
            }
            tokio::select! {
                _ = poke.notified() => continue,
                _ = tokio::time::sleep(window) => break,
            }
        }
        !shared.closed.load(Ordering::Acquire)
    }

    async fn state_loop(shared: Arc<Shared<B, T>>) {
        while Self::debounce(&shared, &shared.state_poke, shared.config.state_debounce).await {
            Self::sync_state(&shared).await;
        }
        debug!("State sync stopped for document {}", shared.document_id);
    }

    async fn autosave_loop(shared: Arc<Shared<B, T>>) {
        while Self::debounce(&shared, &shared.autosave_poke, shared.config.autosave_debounce).await {
            // Failures are logged, counted and re-armed inside.
            let _ = Self::autosave(&shared).await;
        }
        debug!("Autosave stopped for document {}", shared.document_id);
    }

    /// Broadcast the current scene and persist the identical scene.
    async fn sync_state(shared: &Shared<B, T>) {
        let scene = {
            let mut state = shared.state.lock().await;
            if state.applying_external {
                return;
            }
            let scene = state.scene();
            let json = match scene.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Scene of document {} not serializable: {e}", shared.document_id);
                    return;
                }
            };
            if state.last_applied.as_deref() == Some(json.as_slice()) {
                return;
            }
            state.last_applied = Some(json);
            scene
        };

        AtomicBridgeStats::bump(&shared.stats.state_broadcasts, 1);
        let event = OutboundEvent::StateUpdate {
            document_id: shared.document_id,
            scene: scene.clone(),
        };
        if let Err(e) = shared.transport.emit(event).await {
            warn!("State broadcast for document {} failed: {e}", shared.document_id);
        }
        if let Err(e) = shared.backend.save_scene(shared.document_id, scene).await {
            warn!("Scene persist for document {} failed: {e}", shared.document_id);
        }
    }

    /// Send the pending set unless it is empty, already synced or in flight.
    async fn autosave(shared: &Shared<B, T>) -> Result<FlushOutcome, SyncError> {
        let (batch, payload, sent) = {
            let mut state = shared.state.lock().await;
            if state.pending.is_empty() {
                return Ok(FlushOutcome::Skipped);
            }
            let batch = state
                .pending
                .iter()
                .map(NewOperation::from_pending)
                .collect::<Result<Vec<_>, _>>()?;
            let payload = serde_json::to_vec(&batch)
                .map_err(|e| SyncError::SyncFailure(format!("pending set not serializable: {e}")))?;
            if state.last_synced.as_ref() == Some(&payload) || state.in_flight {
                // The flight re-arms the timer for whatever is left pending.
                AtomicBridgeStats::bump(&shared.stats.saves_skipped, 1);
                return Ok(FlushOutcome::Skipped);
            }
            state.in_flight = true;
            let sent: Vec<OperationId> = state.pending.iter().map(|op| op.id.clone()).collect();
            (batch, payload, sent)
        };

        let result = shared.backend.create_batch(shared.document_id, batch).await;
        if shared.closed.load(Ordering::Acquire) {
            debug!("Discarding save result for unmounted document {}", shared.document_id);
            return Ok(FlushOutcome::Discarded);
        }

        match result {
            Ok(confirmed) => {
                let rearm = {
                    let mut state = shared.state.lock().await;
                    state.in_flight = false;
                    state.last_synced = Some(payload);
                    state.saved.extend(confirmed.iter().cloned());
                    state.pending.retain(|op| !sent.contains(&op.id));
                    // Operations staged during the flight may name the
                    // client ids that were just replaced.
                    let renames: Vec<(OperationId, OperationId)> = sent
                        .iter()
                        .cloned()
                        .zip(confirmed.iter().map(|op| op.id.clone()))
                        .collect();
                    for op in state.pending.iter_mut() {
                        rename_references(op, &renames);
                    }
                    !state.pending.is_empty()
                };
                if rearm {
                    shared.autosave_poke.notify_one();
                }

                AtomicBridgeStats::bump(&shared.stats.batches_saved, 1);
                AtomicBridgeStats::bump(&shared.stats.operations_saved, confirmed.len() as u64);
                info!(
                    "Saved {} operation(s) for document {}",
                    confirmed.len(),
                    shared.document_id
                );

                let event = OutboundEvent::OperationsSaved {
                    document_id: shared.document_id,
                    operations: confirmed.clone(),
                };
                if let Err(e) = shared.transport.emit(event).await {
                    warn!("Saved-operations broadcast for document {} failed: {e}", shared.document_id);
                }
                // Server ids replace client ids in the derived scene.
                shared.state_poke.notify_one();
                Ok(FlushOutcome::Saved(confirmed))
            }
            Err(e) => {
                shared.state.lock().await.in_flight = false;
                AtomicBridgeStats::bump(&shared.stats.save_failures, 1);
                warn!(
                    "Autosave for document {} failed, keeping {} pending operation(s): {e}",
                    shared.document_id,
                    sent.len()
                );
                shared.autosave_poke.notify_one();
                Err(e)
            }
        }
    }
}

impl<B: OperationBackend, T: StateTransport> Drop for SyncBridge<B, T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.state_poke.notify_one();
        self.shared.autosave_poke.notify_one();
        // Tasks exit on their own; in-flight calls are allowed to finish.
        self.tasks.clear();
        debug!("Unmounted document {}", self.shared.document_id);
    }
}

fn rename_references(op: &mut Operation, renames: &[(OperationId, OperationId)]) {
    for dep in op.dependencies.iter_mut() {
        if let Some((_, new)) = renames.iter().find(|(old, _)| old == dep) {
            *dep = new.clone();
        }
    }
    if let Some(reference) = op.params.source_reference().cloned() {
        if let Some((_, new)) = renames.iter().find(|(old, _)| *old == reference) {
            op.params.set_source_reference(new.clone());
        }
    }
}
