use std::hint::black_box;
use std::sync::Arc;

use cbir_retrieval::{
    CallerIdentity, EmbeddingRecord, InMemoryStore, IndexManager, Partition, QueryVector,
    RecordStore, RetrievalConfig, RetrievalCoordinator,
};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

const DIM: usize = 512;

/// Deterministic pseudo-random vector (xorshift), so runs are comparable
fn synthetic_vector(seed: u64, dim: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..dim)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 2000) as f32 / 1000.0 - 1.0
        })
        .collect()
}

fn populated_store(size: usize) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new(DIM));
    for i in 0..size {
        let record = EmbeddingRecord::builder()
            .id(format!("img-{:06}", i).as_str())
            .vector(synthetic_vector(i as u64, DIM))
            .shared()
            .build()
            .unwrap();
        store.put(record).unwrap();
    }
    store
}

/// Full rebuild of one partition at different corpus sizes
fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_rebuild");

    for size in [1_000, 10_000].iter() {
        let store = populated_store(*size);
        let manager = IndexManager::new(store, &RetrievalConfig::new(DIM));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_function(format!("rebuild_{}", size), |b| {
            b.iter(|| {
                manager.invalidate(&Partition::Shared);
                black_box(manager.ensure_fresh(&Partition::Shared).unwrap());
            });
        });
    }

    group.finish();
}

/// Exact top-k over a fresh snapshot
fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("exact_search");

    for size in [1_000, 10_000, 50_000].iter() {
        let store = populated_store(*size);
        let manager = IndexManager::new(store, &RetrievalConfig::new(DIM));
        let snapshot = manager.ensure_fresh(&Partition::Shared).unwrap();
        let query = QueryVector::new(synthetic_vector(u64::MAX, DIM), DIM).unwrap();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_function(format!("top20_{}", size), |b| {
            b.iter(|| black_box(snapshot.search(black_box(&query), 20).unwrap()));
        });
    }

    group.finish();
}

/// End-to-end retrieval through the coordinator with a warm index
fn bench_retrieve(c: &mut Criterion) {
    let store = populated_store(10_000);
    let coordinator = RetrievalCoordinator::without_audit(store, RetrievalConfig::new(DIM)).unwrap();
    let caller = CallerIdentity::user("bench");
    let query = synthetic_vector(42, DIM);

    c.bench_function("retrieve_top10_10000", |b| {
        b.iter(|| {
            black_box(
                coordinator
                    .retrieve(query.clone(), Some(10), &caller)
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, bench_rebuild, bench_search, bench_retrieve);
criterion_main!(benches);
