//! Merge store throughput: upserts with a full stats recompute, and flush views.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pricewatch_crawler::application::MergeStore;
use pricewatch_crawler::domain::DetailSnapshot;
use std::sync::Arc;
use tokio::runtime::Runtime;

const SOURCES: [&str; 5] = ["mytek", "jumia", "tunisianet", "spacenet", "wiki"];

fn snapshot(i: usize, round: usize) -> DetailSnapshot {
    let price = 100.0 + (i % 50) as f64 + (round % 3) as f64;
    DetailSnapshot::new(format!("item-{i}"), price, "in_stock").with_source(SOURCES[i % SOURCES.len()])
}

async fn seeded_store(size: usize) -> Arc<MergeStore> {
    let store = Arc::new(MergeStore::new());
    for i in 0..size {
        let _ = store.upsert(snapshot(i, 0)).await;
    }
    store
}

fn upsert_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("upsert_existing");

    for size in [100usize, 1_000, 5_000] {
        let store = rt.block_on(seeded_store(size));
        let mut round = 0usize;
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                round += 1;
                let snapshot = snapshot(round % size, round);
                rt.block_on(async { black_box(store.upsert(snapshot).await) })
            });
        });
    }
    group.finish();
}

fn concurrent_upsert_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("concurrent_upserts_8x250", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(MergeStore::new());
                let mut handles = Vec::new();
                for worker in 0..8 {
                    let store = Arc::clone(&store);
                    handles.push(tokio::spawn(async move {
                        for i in 0..250 {
                            let _ = store.upsert(snapshot(worker * 250 + i, 0)).await;
                        }
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
                black_box(store.len().await)
            })
        });
    });
}

fn view_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(5_000));

    c.bench_function("view_since_5000", |b| {
        b.iter(|| rt.block_on(async { black_box(store.view_since(0).await.products.len()) }));
    });
}

criterion_group!(benches, upsert_benchmark, concurrent_upsert_benchmark, view_benchmark);
criterion_main!(benches);
