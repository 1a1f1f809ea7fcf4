//! Integration tests for the sync bridge over a real operation store.
//!
//! Time is paused, so debounce windows elapse only when every task is idle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use polygon_collab::auth::{DocumentInfo, MembershipDirectory, Role, Session};
use polygon_collab::bridge::{
    BridgeConfig, FlushOutcome, LocalBackend, OperationBackend, OutboundEvent, StateTransport,
    SyncBridge, SyncError,
};
use polygon_collab::cache::GeometryCacheRegistry;
use polygon_collab::storage::{OperationLog, StoreConfig};
use polygon_collab::store::OperationStore;
use polygon_core::{
    DocumentId, NewOperation, Operation, OperationId, OperationParams, OperationType, SceneState,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Duration;
use uuid::Uuid;

/// Store-backed backend that counts batches and can fail or stall them.
#[derive(Clone)]
struct TestBackend {
    inner: LocalBackend,
    batches: Arc<Mutex<Vec<Vec<NewOperation>>>>,
    fail: Arc<AtomicBool>,
    gate: Option<Arc<Gate>>,
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl OperationBackend for TestBackend {
    async fn load_operations(&self, document_id: DocumentId) -> Result<Vec<Operation>, SyncError> {
        self.inner.load_operations(document_id).await
    }

    async fn create_batch(
        &self,
        document_id: DocumentId,
        operations: Vec<NewOperation>,
    ) -> Result<Vec<Operation>, SyncError> {
        self.batches.lock().unwrap().push(operations.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::SyncFailure("network down".into()));
        }
        self.inner.create_batch(document_id, operations).await
    }

    async fn load_scene(&self, document_id: DocumentId) -> Result<Option<SceneState>, SyncError> {
        self.inner.load_scene(document_id).await
    }

    async fn save_scene(&self, document_id: DocumentId, scene: SceneState) -> Result<(), SyncError> {
        self.inner.save_scene(document_id, scene).await
    }
}

#[derive(Clone, Default)]
struct RecordingTransport {
    events: Arc<Mutex<Vec<OutboundEvent>>>,
    state_updates: Arc<AtomicUsize>,
}

impl RecordingTransport {
    fn saved_events(&self) -> Vec<Vec<Operation>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::OperationsSaved { operations, .. } => Some(operations.clone()),
                _ => None,
            })
            .collect()
    }
}

impl StateTransport for RecordingTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<(), SyncError> {
        if matches!(event, OutboundEvent::StateUpdate { .. }) {
            self.state_updates.fetch_add(1, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    store: Arc<OperationStore>,
    session: Session,
    doc: DocumentId,
    backend: TestBackend,
    transport: RecordingTransport,
}

fn setup(gate: Option<Arc<Gate>>) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let log = OperationLog::open(StoreConfig::for_testing(dir.path())).unwrap();
    let directory = MembershipDirectory::new();
    let org = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let session = Session::new(Uuid::new_v4());
    directory.add_document(DocumentInfo::new(doc, org, "Housing"));
    directory.add_member(session.user_id, org, Role::Member);
    let store = Arc::new(OperationStore::new(
        Arc::new(log),
        Arc::new(directory),
        Arc::new(GeometryCacheRegistry::new()),
    ));
    let backend = TestBackend {
        inner: LocalBackend::new(store.clone(), session),
        batches: Arc::default(),
        fail: Arc::default(),
        gate,
    };
    Setup {
        _dir: dir,
        store,
        session,
        doc,
        backend,
        transport: RecordingTransport::default(),
    }
}

async fn mount(s: &Setup) -> SyncBridge<TestBackend, RecordingTransport> {
    SyncBridge::mount(s.doc, s.backend.clone(), s.transport.clone(), BridgeConfig::default())
        .await
        .unwrap()
}

fn rect(x: f64) -> OperationParams {
    OperationParams::parse(
        OperationType::SketchRectangle,
        json!({
            "dimension": "z",
            "startPoint": {"x": 0.0, "y": 0.0, "z": 0.0},
            "endPoint": {"x": x, "y": x, "z": 0.0}
        }),
    )
    .unwrap()
}

fn extrude(sketch: &OperationId) -> OperationParams {
    OperationParams::parse(
        OperationType::Extrude,
        json!({"sketchOperationId": sketch.as_str(), "depth": 5.0}),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_coalesce_into_one_batch() {
    let s = setup(None);
    let bridge = mount(&s).await;

    let sketch = bridge.stage(rect(10.0), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    bridge.stage(extrude(&sketch), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    bridge.stage(rect(4.0), Vec::new()).await;

    // Nothing is sent while edits keep arriving inside the window.
    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert!(s.backend.batches.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let batches = s.backend.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert!(!bridge.has_unsaved_changes().await);

    let stored = s.store.get_by_document(&s.session, s.doc).unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].dependencies, vec![stored[0].id.clone()]);
    assert_eq!(s.transport.saved_events(), vec![stored.clone()]);
    assert_eq!(bridge.operations().await, stored);
}

#[tokio::test(start_paused = true)]
async fn test_identical_state_is_sent_once() {
    let s = setup(None);
    let bridge = mount(&s).await;

    bridge.stage(rect(10.0), Vec::new()).await;
    assert!(matches!(bridge.flush().await.unwrap(), FlushOutcome::Saved(_)));
    assert_eq!(bridge.flush().await.unwrap(), FlushOutcome::Skipped);

    // The debounced fire finds nothing new either.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(s.backend.batches.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_autosave_is_retried() {
    let s = setup(None);
    s.backend.fail.store(true, Ordering::SeqCst);
    let bridge = mount(&s).await;

    bridge.stage(rect(10.0), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(bridge.stats().save_failures, 1);
    assert!(bridge.has_unsaved_changes().await);
    assert!(s.store.get_by_document(&s.session, s.doc).unwrap().is_empty());

    s.backend.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(s.backend.batches.lock().unwrap().len(), 2);
    assert!(!bridge.has_unsaved_changes().await);
    assert_eq!(s.store.get_by_document(&s.session, s.doc).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_during_flight_stays_pending() {
    let gate = Arc::new(Gate::default());
    let s = setup(Some(gate.clone()));
    let bridge = Arc::new(mount(&s).await);

    let sketch = bridge.stage(rect(10.0), Vec::new()).await;
    let flushing = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.flush().await })
    };
    gate.entered.notified().await;

    // Staged while the first batch is in flight.
    bridge.stage(extrude(&sketch), Vec::new()).await;
    gate.release.notify_one();
    let first = match flushing.await.unwrap().unwrap() {
        FlushOutcome::Saved(first) => first,
        other => panic!("expected a save, got {other:?}"),
    };
    assert_eq!(first.len(), 1);

    let ops = bridge.operations().await;
    assert_eq!(ops.len(), 2);
    assert!(bridge.has_unsaved_changes().await);
    // The pending extrude now names the server id of its sketch.
    assert_eq!(ops[1].dependencies, vec![first[0].id.clone()]);

    let second = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.flush().await }
    });
    gate.entered.notified().await;
    gate.release.notify_one();
    assert!(matches!(second.await.unwrap().unwrap(), FlushOutcome::Saved(_)));

    let stored = s.store.get_by_document(&s.session, s.doc).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].dependencies, vec![stored[0].id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_flushes_save_each_operation_once() {
    let gate = Arc::new(Gate::default());
    let s = setup(Some(gate.clone()));
    let bridge = Arc::new(mount(&s).await);

    bridge.stage(rect(10.0), Vec::new()).await;
    let flushing = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.flush().await })
    };
    gate.entered.notified().await;

    bridge.stage(rect(4.0), Vec::new()).await;
    assert_eq!(bridge.flush().await.unwrap(), FlushOutcome::Skipped);
    assert_eq!(s.backend.batches.lock().unwrap().len(), 1);

    gate.release.notify_one();
    assert!(matches!(flushing.await.unwrap().unwrap(), FlushOutcome::Saved(_)));
    assert!(bridge.has_unsaved_changes().await);

    // The finished flight re-armed the timer for the remaining edit.
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(s.backend.batches.lock().unwrap().len(), 2);
    assert_eq!(s.backend.batches.lock().unwrap()[1].len(), 1);
    gate.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!bridge.has_unsaved_changes().await);
    let stored = s.store.get_by_document(&s.session, s.doc).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(bridge.operations().await, stored);
}

#[tokio::test(start_paused = true)]
async fn test_unmount_discards_in_flight_result() {
    let gate = Arc::new(Gate::default());
    let s = setup(Some(gate.clone()));
    let bridge = mount(&s).await;

    bridge.stage(rect(10.0), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(s.backend.batches.lock().unwrap().len(), 1);

    drop(bridge);
    gate.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The store accepted the batch, but nobody is told about it.
    assert_eq!(s.store.get_by_document(&s.session, s.doc).unwrap().len(), 1);
    assert!(s.transport.saved_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_state_sync_broadcasts_and_persists() {
    let s = setup(None);
    let bridge = mount(&s).await;

    bridge.stage(rect(10.0), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(s.transport.state_updates.load(Ordering::SeqCst), 1);

    let persisted = s.store.load_scene(&s.session, s.doc).unwrap().unwrap();
    assert_eq!(persisted, bridge.scene().await);
    assert_eq!(persisted.sketches.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_state_is_not_echoed() {
    let s = setup(None);
    let bridge = mount(&s).await;
    assert!(!bridge.is_using_database().await);

    let ops = vec![Operation::new(OperationId::from("r1"), 0, rect(3.0), Vec::new())];
    let remote = SceneState::from_operations(&ops);
    assert!(bridge.hydrate(&remote.to_json().unwrap()).await);
    assert_eq!(bridge.scene().await, remote);

    assert!(!bridge.apply_remote_state(br#"{"sketches": 7}"#).await);
    assert_eq!(bridge.scene().await, remote);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(s.transport.state_updates.load(Ordering::SeqCst), 0);
    assert!(s.backend.batches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_merge_remote_operations_upserts_by_id() {
    let s = setup(None);
    let bridge = mount(&s).await;

    let a = Operation::new(OperationId::from("a"), 1, rect(1.0), Vec::new());
    let b = Operation::new(OperationId::from("b"), 0, rect(2.0), Vec::new());
    bridge.merge_remote_operations(vec![a.clone(), b.clone()]).await;

    let mut a2 = a.clone();
    a2.params = rect(9.0);
    bridge.merge_remote_operations(vec![a2.clone()]).await;

    assert!(bridge.is_using_database().await);
    assert_eq!(bridge.operations().await, vec![b, a2]);
    assert!(!bridge.has_unsaved_changes().await);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_scene_migrates_into_operations() {
    let s = setup(None);
    let ops = vec![
        Operation::new(OperationId::from("legacy-1"), 0, rect(10.0), Vec::new()),
        Operation::new(
            OperationId::from("legacy-2"),
            1,
            extrude(&OperationId::from("legacy-1")),
            vec![OperationId::from("legacy-1")],
        ),
    ];
    let legacy = SceneState::from_operations(&ops);
    s.store.save_scene(&s.session, s.doc, &legacy).unwrap();

    let bridge = mount(&s).await;
    assert!(!bridge.is_using_database().await);
    assert_eq!(bridge.scene().await, legacy);

    let created = bridge.migrate_legacy().await.unwrap();
    assert_eq!(created, 2);
    assert!(bridge.is_using_database().await);

    let stored = s.store.get_by_document(&s.session, s.doc).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(bridge.extruded_shapes().await.len(), 1);
    assert_eq!(bridge.migrate_legacy().await.unwrap(), 0);
}
