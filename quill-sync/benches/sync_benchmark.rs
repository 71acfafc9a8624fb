use criterion::{criterion_group, criterion_main, Criterion};
use quill_ot::{transform_against, Operation, OperationWire};
use quill_sync::broadcast::BroadcastGroup;
use quill_sync::client::OfflineQueue;
use quill_sync::config::DocumentConfig;
use quill_sync::document::DocumentRegistry;
use quill_sync::presence::color_for_user;
use quill_sync::protocol::{ClientMessage, ServerMessage};
use quill_sync::storage::{MemoryStore, RocksStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn typing_ops(count: usize, author: &str) -> Vec<Operation> {
    (0..count)
        .map(|i| Operation::insert(format!("{author}-{i}"), author, i, "a", i as u64))
        .collect()
}

// ─── Protocol benchmarks ────────────────────────────────────────

fn bench_operation_decode(c: &mut Criterion) {
    let frame = ClientMessage::DocumentOperation {
        operation: OperationWire::from(&Operation::insert("op-1", "alice", 42, "hello", 7)),
        base_version: 41,
    }
    .encode()
    .unwrap();

    c.bench_function("client_operation_decode", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_document_operation_encode(c: &mut Criterion) {
    let content = "lorem ipsum ".repeat(100);
    let msg = ServerMessage::DocumentOperation {
        operation: OperationWire::from(&Operation::insert("op-1", "alice", 42, "hello", 7)),
        version: 42,
        content,
    };

    c.bench_function("document_operation_encode_1KB", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

// ─── Transform benchmarks ───────────────────────────────────────

fn bench_transform_against_100(c: &mut Criterion) {
    let history = typing_ops(100, "bob");
    let op = Operation::insert("late", "alice", 50, "x", 0);

    c.bench_function("transform_against_100_ops", |b| {
        b.iter(|| {
            black_box(transform_against(black_box(&op), history.iter()));
        })
    });
}

fn bench_apply_sequential(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("apply_1000_sequential_ops", |b| {
        b.to_async(&rt).iter(|| async {
            let registry =
                DocumentRegistry::new(Arc::new(MemoryStore::new()), DocumentConfig::default());
            for (i, op) in typing_ops(1000, "alice").iter().enumerate() {
                registry
                    .apply_client_operation("bench", op, i as u64)
                    .await
                    .unwrap();
            }
        })
    });
}

fn bench_apply_concurrent_window(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // One late edit folded over a full window of concurrent history.
    c.bench_function("apply_against_1000_window", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let registry =
                    DocumentRegistry::new(Arc::new(MemoryStore::new()), DocumentConfig::default());
                let start_version = 0u64;
                for (i, op) in typing_ops(999, "bob").iter().enumerate() {
                    registry
                        .apply_client_operation("bench", op, i as u64)
                        .await
                        .unwrap();
                }

                let start = std::time::Instant::now();
                for i in 0..iters {
                    let op = Operation::insert(format!("late-{i}"), "alice", 0, "x", 0);
                    let applied = registry
                        .apply_client_operation("bench", &op, start_version + i)
                        .await;
                    black_box(applied.ok());
                }
                start.elapsed()
            })
        })
    });
}

// ─── Fan-out benchmarks ─────────────────────────────────────────

fn bench_broadcast_100_receivers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let origin = Uuid::new_v4();

    c.bench_function("broadcast_100_receivers", |b| {
        b.iter(|| {
            let count = group.broadcast(
                Some(origin),
                ServerMessage::UserLeft {
                    user_id: "alice".into(),
                },
            );
            black_box(count);
        })
    });
    drop(receivers);
}

// ─── Client benchmarks ──────────────────────────────────────────

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for (i, op) in typing_ops(1000, "alice").into_iter().enumerate() {
                queue.enqueue(op, i as u64);
            }
            black_box(queue.drain());
        })
    });
}

fn bench_color_for_user(c: &mut Criterion) {
    c.bench_function("color_for_user", |b| {
        b.iter(|| {
            black_box(color_for_user(black_box("someone@example.com")));
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────────

fn bench_persist_rocks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("quill_bench_persist_{}", Uuid::new_v4()));
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&dir)).unwrap());
    let registry = DocumentRegistry::new(store, DocumentConfig::default());

    c.bench_function("apply_and_persist_rocksdb", |b| {
        let mut version = 0u64;
        b.iter(|| {
            let op = Operation::insert(format!("op-{version}"), "alice", 0, "a", version);
            rt.block_on(registry.apply_client_operation("bench", &op, version))
                .unwrap();
            version += 1;
        })
    });

    drop(registry);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_operation_decode,
    bench_document_operation_encode,
    bench_transform_against_100,
    bench_apply_sequential,
    bench_apply_concurrent_window,
    bench_broadcast_100_receivers,
    bench_offline_queue,
    bench_color_for_user,
    bench_persist_rocks,
);
criterion_main!(benches);
