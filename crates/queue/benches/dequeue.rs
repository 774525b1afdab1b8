//! Dequeue benchmark
//!
//! Measures the lease critical path: send → dequeue → commit, single
//! consumer and under contention from several concurrent consumers.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use durable_queue::persistence::{DequeueFilter, Dequeued, InMemoryLeaseStore, LeaseStore};
use durable_queue::NewMessage;

async fn fill(store: &InMemoryLeaseStore, count: u64) {
    for i in 0..count {
        store
            .send(NewMessage::new(i.to_le_bytes().to_vec()).with_priority((i % 4) as u8))
            .await
            .unwrap();
    }
}

/// Drain the store, committing every message; returns how many were processed
async fn drain(store: Arc<InMemoryLeaseStore>) -> u64 {
    let mut processed = 0;
    while let Some(dequeued) = store.dequeue(&DequeueFilter::new(Utc::now())).await.unwrap() {
        match dequeued {
            Dequeued::Message(message) => {
                store.commit(message.id).await.unwrap();
                processed += 1;
            }
            Dequeued::Poison { id, .. } => panic!("unexpected poison message {id}"),
        }
    }
    processed
}

/// Single consumer baseline
fn bench_dequeue_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dequeue/single");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_dequeue_commit", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = Arc::new(InMemoryLeaseStore::new());
            fill(&store, iters).await;

            let start = Instant::now();
            let processed = drain(store).await;
            assert_eq!(processed, iters);
            start.elapsed()
        });
    });

    group.finish();
}

/// Concurrent consumers contending for the same queue
fn bench_dequeue_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dequeue/concurrent");
    group.sample_size(20);

    for consumers in [2, 4, 8] {
        let message_count = 2000u64;
        group.throughput(Throughput::Elements(message_count));
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, &consumers| {
                b.to_async(&rt).iter(|| async move {
                    let store = Arc::new(InMemoryLeaseStore::new());
                    fill(&store, message_count).await;

                    let handles: Vec<_> = (0..consumers)
                        .map(|_| tokio::spawn(drain(store.clone())))
                        .collect();

                    let mut total = 0;
                    for handle in handles {
                        total += handle.await.unwrap();
                    }
                    assert_eq!(total, message_count);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dequeue_single, bench_dequeue_concurrent);
criterion_main!(benches);
