use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use polygon_collab::auth::{DocumentInfo, MembershipDirectory, Role, Session};
use polygon_collab::cache::GeometryCacheRegistry;
use polygon_collab::protocol::{PeerInfo, RpcCall, RpcRequest, SyncMessage, MessageType};
use polygon_collab::room::Room;
use polygon_collab::storage::{OperationLog, StoreConfig};
use polygon_collab::store::OperationStore;
use polygon_collab::OfflineQueue;
use polygon_core::{NewOperation, Operation, OperationId, OperationParams, OperationType, SceneState};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn rect_params(i: usize) -> serde_json::Value {
    json!({
        "dimension": "z",
        "startPoint": {"x": 0.0, "y": 0.0, "z": 0.0},
        "endPoint": {"x": i as f64 + 1.0, "y": 2.0, "z": 0.0}
    })
}

fn scene_json(sketches: usize) -> Vec<u8> {
    let ops: Vec<Operation> = (0..sketches)
        .map(|i| {
            let params = OperationParams::parse(OperationType::SketchRectangle, rect_params(i)).unwrap();
            Operation::new(OperationId::generate(), i as u64, params, Vec::new())
        })
        .collect();
    SceneState::from_operations(&ops).to_json().unwrap()
}

fn bench_state_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let scene = scene_json(20);

    c.bench_function("state_update_encode_20_sketches", |b| {
        b.iter(|| {
            let msg = SyncMessage::state_update(
                black_box(peer),
                black_box(doc),
                black_box(1),
                black_box(scene.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_state_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::state_update(Uuid::new_v4(), Uuid::new_v4(), 1, scene_json(20));
    let encoded = msg.encode().unwrap();

    c.bench_function("state_update_decode_20_sketches", |b| {
        b.iter(|| {
            let frame = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(SceneState::parse(&frame.payload).unwrap());
        })
    });
}

fn bench_rpc_request_roundtrip(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let operations: Vec<NewOperation> = (0..10)
        .map(|i| NewOperation::new(OperationType::SketchRectangle, rect_params(i)))
        .collect();
    let request = RpcRequest {
        request_id: 1,
        call: RpcCall::CreateBatch { operations },
    };

    c.bench_function("rpc_create_batch_10_roundtrip", |b| {
        b.iter(|| {
            let msg = SyncMessage::with_json(MessageType::Request, peer, doc, 0, black_box(&request)).unwrap();
            let encoded = msg.encode().unwrap();
            let frame = SyncMessage::decode(&encoded).unwrap();
            black_box(frame.json::<RpcRequest>(MessageType::Request).unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(2048);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let peer = PeerInfo {
                        peer_id: Uuid::new_v4(),
                        user_id: Uuid::new_v4(),
                    };
                    receivers.push(room.admit(peer, usize::MAX).await);
                }

                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 64]);
                    room.publish_encoded(black_box(data));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let payload = scene_json(5);

    c.bench_function("offline_queue_1000_replay", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, payload.clone());
            }
            black_box(queue.drain());
        })
    });
}

fn open_store() -> (tempfile::TempDir, OperationStore, Session, Uuid) {
    let dir = tempfile::tempdir().unwrap();
    let log = OperationLog::open(StoreConfig::for_testing(dir.path())).unwrap();
    let directory = MembershipDirectory::new();
    let org = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let user = Uuid::new_v4();
    directory.add_document(DocumentInfo::new(doc, org, "Bench"));
    directory.add_member(user, org, Role::Owner);
    let store = OperationStore::new(
        Arc::new(log),
        Arc::new(directory),
        Arc::new(GeometryCacheRegistry::new()),
    );
    (dir, store, Session::new(user), doc)
}

fn batch(size: usize) -> Vec<NewOperation> {
    let mut ops = Vec::with_capacity(size);
    for i in 0..size / 2 {
        let sketch = format!("tmp-{i}");
        ops.push(
            NewOperation::new(OperationType::SketchRectangle, rect_params(i)).with_client_id(sketch.as_str()),
        );
        ops.push(
            NewOperation::new(
                OperationType::Extrude,
                json!({"sketchOperationId": sketch, "depth": 5.0}),
            )
            .depends_on(sketch.as_str()),
        );
    }
    ops
}

fn bench_create_batch(c: &mut Criterion) {
    let (_dir, store, session, doc) = open_store();

    c.bench_function("create_batch_100_ops", |b| {
        b.iter_batched(
            || batch(100),
            |ops| black_box(store.create_batch(&session, doc, ops).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_get_by_document(c: &mut Criterion) {
    let (_dir, store, session, doc) = open_store();
    for _ in 0..10 {
        store.create_batch(&session, doc, batch(100)).unwrap();
    }

    c.bench_function("get_by_document_1000_ops", |b| {
        b.iter(|| black_box(store.get_by_document(&session, black_box(doc)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_state_update_encode,
    bench_state_update_decode,
    bench_rpc_request_roundtrip,
    bench_broadcast_1000_messages,
    bench_offline_queue,
    bench_create_batch,
    bench_get_by_document,
);
criterion_main!(benches);
