//! Integration tests for the operation store over a real RocksDB log.
//!
//! Covers sequence assignment (including concurrent writers), dependency
//! ordering, delete safety, batch atomicity, restart durability, export,
//! and the history sink.

use std::sync::Arc;

use polygon_collab::auth::{Authorizer, DocumentInfo, MembershipDirectory, Role, Session};
use polygon_collab::cache::GeometryCacheRegistry;
use polygon_collab::export::{export_document, ExportFormat, ExportOptions, NativeDocument};
use polygon_collab::storage::{OperationLog, StoreConfig};
use polygon_collab::store::OperationStore;
use polygon_core::history::SketchAction;
use polygon_core::{
    ActionDraft, ActionKind, CheckpointStore, DocumentId, HistoryEngine, HistoryOptions,
    NewOperation, OperationError, OperationId, OperationType,
};
use serde_json::json;
use uuid::Uuid;

struct Harness {
    dir: tempfile::TempDir,
    directory: Arc<MembershipDirectory>,
    store: OperationStore,
    doc: DocumentId,
    owner: Session,
}

fn open_store(dir: &tempfile::TempDir, directory: Arc<MembershipDirectory>) -> OperationStore {
    let log = OperationLog::open(StoreConfig::for_testing(dir.path())).unwrap();
    OperationStore::new(Arc::new(log), directory, Arc::new(GeometryCacheRegistry::new()))
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let directory = Arc::new(MembershipDirectory::new());
    let org = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let owner = Session::new(Uuid::new_v4());
    directory.add_document(DocumentInfo::new(doc, org, "Bracket"));
    directory.add_member(owner.user_id, org, Role::Owner);
    let store = open_store(&dir, directory.clone());
    Harness {
        dir,
        directory,
        store,
        doc,
        owner,
    }
}

fn rect(x: f64) -> NewOperation {
    NewOperation::new(
        OperationType::SketchRectangle,
        json!({
            "dimension": "z",
            "startPoint": {"x": 0.0, "y": 0.0, "z": 0.0},
            "endPoint": {"x": x, "y": x, "z": 0.0}
        }),
    )
}

fn extrude(sketch: &OperationId, depth: f64) -> NewOperation {
    NewOperation::new(
        OperationType::Extrude,
        json!({"sketchOperationId": sketch.as_str(), "depth": depth}),
    )
    .depends_on(sketch.clone())
}

#[test]
fn test_rectangle_extrude_scenario() {
    let h = harness();
    let rect_op = h.store.create(&h.owner, h.doc, rect(10.0)).unwrap();
    let extrude_op = h
        .store
        .create(&h.owner, h.doc, extrude(&rect_op.id, 5.0))
        .unwrap();

    let ops = h.store.get_by_document(&h.owner, h.doc).unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].sequence, 0);
    assert_eq!(ops[0].op_type(), OperationType::SketchRectangle);
    assert_eq!(ops[1].sequence, 1);
    assert_eq!(ops[1].op_type(), OperationType::Extrude);
    assert_eq!(ops[1].dependencies, vec![rect_op.id.clone()]);

    match h.store.delete(&h.owner, &rect_op.id) {
        Err(OperationError::DependencyConflict { blocking, .. }) => {
            assert_eq!(blocking, vec![extrude_op.id.clone()]);
        }
        other => panic!("expected DependencyConflict, got {other:?}"),
    }

    h.store.delete(&h.owner, &extrude_op.id).unwrap();
    h.store.delete(&h.owner, &rect_op.id).unwrap();
    assert!(h.store.get_by_document(&h.owner, h.doc).unwrap().is_empty());
}

#[test]
fn test_batch_sequences_are_contiguous_and_increasing() {
    let h = harness();
    h.store.create(&h.owner, h.doc, rect(1.0)).unwrap();
    h.store.create(&h.owner, h.doc, rect(2.0)).unwrap();

    let created = h
        .store
        .create_batch(&h.owner, h.doc, vec![rect(3.0), rect(4.0), rect(5.0)])
        .unwrap();
    let sequences: Vec<u64> = created.iter().map(|op| op.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);

    // Deleted operations never release their sequence.
    h.store.delete(&h.owner, &created[2].id).unwrap();
    let next = h.store.create(&h.owner, h.doc, rect(6.0)).unwrap();
    assert_eq!(next.sequence, 5);
}

#[test]
fn test_concurrent_batches_never_interleave() {
    const THREADS: usize = 4;
    const BATCHES: usize = 5;
    const BATCH_LEN: usize = 3;

    let h = harness();
    let store = Arc::new(h.store);
    let batches: Vec<Vec<u64>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                let (owner, doc) = (h.owner, h.doc);
                scope.spawn(move || {
                    (0..BATCHES)
                        .map(|b| {
                            let sketch = format!("s-{t}-{b}");
                            let items = vec![
                                rect(1.0 + t as f64).with_client_id(sketch.as_str()),
                                NewOperation::new(
                                    OperationType::Extrude,
                                    json!({"sketchOperationId": &sketch, "depth": 2.0}),
                                )
                                .depends_on(sketch.as_str()),
                                rect(3.0),
                            ];
                            store
                                .create_batch(&owner, doc, items)
                                .unwrap()
                                .iter()
                                .map(|op| op.sequence)
                                .collect::<Vec<u64>>()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    for batch in &batches {
        assert_eq!(batch.len(), BATCH_LEN);
        assert!(batch.windows(2).all(|w| w[1] == w[0] + 1), "batch split: {batch:?}");
    }
    let mut all: Vec<u64> = batches.into_iter().flatten().collect();
    all.sort_unstable();
    let total = (THREADS * BATCHES * BATCH_LEN) as u64;
    assert_eq!(all, (0..total).collect::<Vec<_>>());

    let stored = store.get_by_document(&h.owner, h.doc).unwrap();
    assert_eq!(stored.len() as u64, total);
    assert!(stored.iter().enumerate().all(|(i, op)| op.sequence == i as u64));
}

#[test]
fn test_dependencies_point_backwards() {
    let h = harness();
    let later = OperationId::from("not-yet-created");
    let before = h.store.get_by_document(&h.owner, h.doc).unwrap();

    let result = h.store.create(&h.owner, h.doc, rect(1.0).depends_on(later));
    assert!(matches!(result, Err(OperationError::InvalidParameters { .. })));
    assert_eq!(h.store.get_by_document(&h.owner, h.doc).unwrap(), before);

    // Within a batch a dependency may only name an earlier item.
    let result = h.store.create_batch(
        &h.owner,
        h.doc,
        vec![
            rect(1.0).depends_on("second"),
            rect(2.0).with_client_id("second"),
        ],
    );
    assert!(matches!(result, Err(OperationError::InvalidParameters { .. })));

    let created = h
        .store
        .create_batch(
            &h.owner,
            h.doc,
            vec![
                rect(1.0).with_client_id("first"),
                rect(2.0).depends_on("first"),
            ],
        )
        .unwrap();
    for op in &created {
        for dep in &op.dependencies {
            let target = created.iter().find(|o| &o.id == dep).unwrap();
            assert!(target.sequence < op.sequence);
        }
    }
}

#[test]
fn test_invalid_batch_item_persists_nothing() {
    let h = harness();
    h.store.create(&h.owner, h.doc, rect(1.0)).unwrap();
    let before = h.store.get_by_document(&h.owner, h.doc).unwrap();

    let bad = NewOperation::new(
        OperationType::SketchCircle,
        json!({"dimension": "z", "center": {"x": 0.0, "y": 0.0, "z": 0.0}, "radius": -1.0}),
    );
    let result = h.store.create_batch(&h.owner, h.doc, vec![rect(2.0), bad, rect(3.0)]);

    match result {
        Err(OperationError::InvalidParameters { message }) => {
            assert!(message.starts_with("operations[1]"), "{message}");
        }
        other => panic!("expected InvalidParameters, got {other:?}"),
    }
    assert_eq!(h.store.get_by_document(&h.owner, h.doc).unwrap(), before);

    // The failed batch consumed no sequences.
    let next = h.store.create(&h.owner, h.doc, rect(4.0)).unwrap();
    assert_eq!(next.sequence, 1);
}

#[test]
fn test_operations_survive_reopen() {
    let h = harness();
    let sketch = h.store.create(&h.owner, h.doc, rect(10.0)).unwrap();
    h.store
        .create(&h.owner, h.doc, extrude(&sketch.id, 2.0))
        .unwrap();
    let before = h.store.get_by_document(&h.owner, h.doc).unwrap();

    let Harness {
        dir,
        directory,
        store,
        doc,
        owner,
    } = h;
    drop(store);

    let reopened = open_store(&dir, directory);
    assert_eq!(reopened.get_by_document(&owner, doc).unwrap(), before);
    let next = reopened.create(&owner, doc, rect(3.0)).unwrap();
    assert_eq!(next.sequence, 2);
}

#[test]
fn test_member_cannot_delete() {
    let h = harness();
    let org = h.directory.document(h.doc).unwrap().organization_id;
    let member = Session::new(Uuid::new_v4());
    h.directory.add_member(member.user_id, org, Role::Member);

    let op = h.store.create(&member, h.doc, rect(1.0)).unwrap();
    assert!(matches!(
        h.store.delete(&member, &op.id),
        Err(OperationError::Forbidden { .. })
    ));
    h.store.delete(&h.owner, &op.id).unwrap();
}

#[test]
fn test_json_export_of_stored_document() {
    let h = harness();
    let sketch = h.store.create(&h.owner, h.doc, rect(10.0)).unwrap();
    h.store
        .create(&h.owner, h.doc, extrude(&sketch.id, 5.0))
        .unwrap();

    let artifact = export_document(
        &h.store,
        &h.owner,
        h.doc,
        ExportFormat::Json,
        &ExportOptions::default(),
    )
    .unwrap();
    let native: NativeDocument = serde_json::from_slice(&artifact.decode_data().unwrap()).unwrap();
    assert_eq!(native.operations.len(), 2);
    assert_eq!(native.operations[1].dependencies, vec![sketch.id]);

    let stl = export_document(&h.store, &h.owner, h.doc, ExportFormat::Stl, &ExportOptions::default());
    assert!(matches!(stl, Err(OperationError::NotImplemented { .. })));
}

#[test]
fn test_history_resumes_from_stored_checkpoint() {
    let h = harness();
    let log = h.store.log().clone();
    let options = HistoryOptions {
        checkpoint_interval: 3,
        ..HistoryOptions::default()
    };

    let mut engine = HistoryEngine::new(h.doc, h.owner.user_id, options.clone(), log.clone());
    for i in 0..7u64 {
        engine.record_action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::DrawRectangle))
                .target(format!("s{i}"))
                .param("width", i),
        );
    }
    assert_eq!(engine.sync_pending(log.as_ref()).unwrap(), 7);
    assert_eq!(log.load_history(h.doc).unwrap().len(), 7);
    let middle: Vec<u64> = log
        .load_history_range(h.doc, 3, 5)
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(middle, vec![3, 4, 5]);

    let resumed = HistoryEngine::resume(h.doc, h.owner.user_id, options, log.clone()).unwrap();
    assert_eq!(resumed.current_version(), 6);
    assert_eq!(
        log.latest_checkpoint(h.doc).unwrap().unwrap().version,
        6
    );
}

#[test]
fn test_superseded_history_is_removed_from_log() {
    let h = harness();
    let log = h.store.log().clone();
    let mut engine =
        HistoryEngine::new(h.doc, h.owner.user_id, HistoryOptions::default(), log.clone());
    let draw = |target: &str| {
        ActionDraft::new(ActionKind::Sketch(SketchAction::DrawRectangle)).target(target)
    };

    for i in 1..=5 {
        engine.record_action(draw(&format!("s{i}")));
    }
    engine.sync_pending(log.as_ref()).unwrap();
    for _ in 0..3 {
        assert!(engine.undo());
    }
    engine.record_action(draw("replacement"));
    engine.sync_pending(log.as_ref()).unwrap();

    let history = log.load_history(h.doc).unwrap();
    let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(history[2].action.target_id.as_deref(), Some("replacement"));

    engine.clear_history();
    engine.sync_pending(log.as_ref()).unwrap();
    assert!(log.load_history(h.doc).unwrap().is_empty());
}
