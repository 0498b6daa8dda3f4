//! End-to-end retrieval behaviour over both store backends

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cbir_retrieval::{
    CallerIdentity, EmbeddingRecord, InMemoryAuditLog, InMemoryStore, IndexStatus, OwnerId,
    Partition, RecordId, RecordScan, RecordStore, Result, RetrievalConfig, RetrievalCoordinator,
    RetrievalError, RocksDbStore,
};
use tempfile::TempDir;

fn shared(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
    EmbeddingRecord::builder()
        .id(id)
        .vector(vector)
        .shared()
        .build()
        .unwrap()
}

fn owned(id: &str, owner: &str, vector: Vec<f32>) -> EmbeddingRecord {
    EmbeddingRecord::builder()
        .id(id)
        .vector(vector)
        .owned_by(OwnerId::new(owner))
        .build()
        .unwrap()
}

fn coordinator(dimension: usize) -> RetrievalCoordinator {
    let store = Arc::new(InMemoryStore::new(dimension));
    RetrievalCoordinator::new(
        store,
        Arc::new(InMemoryAuditLog::new()),
        RetrievalConfig::new(dimension),
    )
    .unwrap()
}

fn ids(results: &[cbir_retrieval::RankedResult]) -> Vec<&str> {
    results.iter().map(|r| r.id.as_str()).collect()
}

/// Small deterministic corpus spread around the unit circle in 4 dimensions
fn spread_vector(i: usize) -> Vec<f32> {
    let t = i as f32 * 0.37;
    vec![t.cos(), t.sin(), (t * 0.5).cos(), 0.25]
}

#[test]
fn test_three_vector_example() {
    let c = coordinator(2);
    let admin = CallerIdentity::admin("curator");
    c.put_record(shared("v1", vec![1.0, 0.0]), &admin).unwrap();
    c.put_record(shared("v2", vec![0.0, 1.0]), &admin).unwrap();
    c.put_record(shared("v3", vec![0.7, 0.7]), &admin).unwrap();

    let results = c
        .retrieve(vec![1.0, 0.0], Some(2), &CallerIdentity::user("alice"))
        .unwrap();

    assert_eq!(ids(&results), vec!["v1", "v3"]);
    assert_eq!(results[0].score, 100.0);
    assert_eq!(results[0].distance, 0.0);
    // Squared distance between unit [1,0] and [0.707,0.707] is 2 - sqrt(2)
    assert!((results[1].distance - 0.5858).abs() < 1e-3);
    assert!((results[1].score - 41.42).abs() < 1e-2);
}

#[test]
fn test_results_bounded_and_sorted() {
    let c = coordinator(4);
    let admin = CallerIdentity::admin("curator");
    for i in 0..60 {
        c.put_record(shared(&format!("s{:02}", i), spread_vector(i)), &admin)
            .unwrap();
    }

    for top_k in [1, 5, 17, 60, 100] {
        let results = c
            .retrieve(vec![1.0, 0.0, 1.0, 0.25], Some(top_k), &CallerIdentity::user("u"))
            .unwrap();
        assert!(results.len() <= top_k);
        assert!(results.iter().all(|r| (0.0..=100.0).contains(&r.score)));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

#[test]
fn test_exact_vector_ranks_first_after_put() {
    let c = coordinator(4);
    let alice = CallerIdentity::user("alice");
    for i in 0..20 {
        c.put_record(owned(&format!("a{:02}", i), "alice", spread_vector(i)), &alice)
            .unwrap();
    }
    // Prime the index, then mutate
    c.retrieve(spread_vector(0), Some(1), &alice).unwrap();

    let needle = vec![0.1, -0.4, 0.8, 0.3];
    c.put_record(owned("needle", "alice", needle.clone()), &alice)
        .unwrap();

    let results = c.retrieve(needle, Some(3), &alice).unwrap();
    assert_eq!(results[0].id.as_str(), "needle");
    assert_eq!(results[0].score, 100.0);
}

#[test]
fn test_deleted_record_never_returned() {
    let c = coordinator(2);
    let alice = CallerIdentity::user("alice");
    c.put_record(owned("keep", "alice", vec![0.9, 0.1]), &alice)
        .unwrap();
    c.put_record(owned("gone", "alice", vec![1.0, 0.0]), &alice)
        .unwrap();
    assert_eq!(
        ids(&c.retrieve(vec![1.0, 0.0], Some(5), &alice).unwrap()),
        vec!["gone", "keep"]
    );

    c.delete_record(&RecordId::new("gone"), &alice).unwrap();
    for _ in 0..2 {
        let results = c.retrieve(vec![1.0, 0.0], Some(5), &alice).unwrap();
        assert_eq!(ids(&results), vec!["keep"]);
    }
}

#[test]
fn test_private_records_never_leak() {
    let c = coordinator(2);
    let alice = CallerIdentity::user("alice");
    let bob = CallerIdentity::user("bob");
    c.put_record(owned("alice-secret", "alice", vec![1.0, 0.0]), &alice)
        .unwrap();
    c.put_record(owned("bob-far", "bob", vec![-1.0, 0.0]), &bob)
        .unwrap();
    c.put_record(
        shared("catalog", vec![0.0, 1.0]),
        &CallerIdentity::admin("curator"),
    )
    .unwrap();

    // Bob's query is exactly Alice's vector; both visible hits score 0
    let results = c.retrieve(vec![1.0, 0.0], Some(10), &bob).unwrap();
    assert_eq!(ids(&results), vec!["bob-far", "catalog"]);

    let results = c.retrieve(vec![1.0, 0.0], Some(10), &alice).unwrap();
    assert_eq!(ids(&results), vec!["alice-secret", "catalog"]);
}

#[test]
fn test_admin_sees_every_partition() {
    let c = coordinator(2);
    c.put_record(owned("a", "alice", vec![1.0, 0.0]), &CallerIdentity::user("alice"))
        .unwrap();
    c.put_record(owned("b", "bob", vec![0.9, 0.1]), &CallerIdentity::user("bob"))
        .unwrap();
    c.put_record(shared("s", vec![0.0, 1.0]), &CallerIdentity::admin("curator"))
        .unwrap();

    let results = c
        .retrieve(vec![1.0, 0.0], Some(10), &CallerIdentity::admin("root"))
        .unwrap();
    assert_eq!(ids(&results), vec!["a", "b", "s"]);
    assert_eq!(results[2].partition, Partition::Shared);
}

#[test]
fn test_identical_queries_are_deterministic() {
    let c = coordinator(2);
    let admin = CallerIdentity::admin("curator");
    // Equal distances everywhere: order is decided by id alone
    for id in ["m", "c", "x", "a", "q"] {
        c.put_record(shared(id, vec![0.0, 1.0]), &admin).unwrap();
    }

    let caller = CallerIdentity::user("u");
    let first = c.retrieve(vec![1.0, 0.0], Some(3), &caller).unwrap();
    let second = c.retrieve(vec![1.0, 0.0], Some(3), &caller).unwrap();
    assert_eq!(first, second);
    assert_eq!(ids(&first), vec!["a", "c", "m"]);
}

#[test]
fn test_fewer_visible_than_top_k() {
    let c = coordinator(2);
    let alice = CallerIdentity::user("alice");
    let bob = CallerIdentity::user("bob");
    for i in 0..3 {
        c.put_record(owned(&format!("mine{}", i), "alice", vec![1.0, i as f32]), &alice)
            .unwrap();
    }
    for i in 0..25 {
        c.put_record(owned(&format!("theirs{:02}", i), "bob", vec![1.0, i as f32 * 0.01]), &bob)
            .unwrap();
    }

    let results = c.retrieve(vec![1.0, 0.0], Some(10), &alice).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.id.as_str().starts_with("mine")));
}

#[test]
fn test_equal_rounded_scores_order_by_id() {
    let c = coordinator(2);
    let admin = CallerIdentity::admin("curator");
    // Distances 0.1 and 0.10002 both score 90.00; the farther one has the smaller id
    c.put_record(shared("zeta", vec![0.95, 0.0975f32.sqrt()]), &admin)
        .unwrap();
    let x = 0.94999f32;
    c.put_record(shared("alpha", vec![x, (1.0 - x * x).sqrt()]), &admin)
        .unwrap();

    let results = c
        .retrieve(vec![1.0, 0.0], Some(2), &CallerIdentity::user("u"))
        .unwrap();
    assert_eq!(ids(&results), vec!["alpha", "zeta"]);
    assert_eq!(results[0].score, results[1].score);
    assert!(results[0].distance > results[1].distance);
}

#[test]
fn test_existing_id_cannot_be_taken_over() {
    let c = coordinator(2);
    let admin = CallerIdentity::admin("curator");
    let alice = CallerIdentity::user("alice");
    let bob = CallerIdentity::user("bob");
    c.put_record(shared("catalog", vec![0.0, 1.0]), &admin).unwrap();
    c.put_record(owned("bob-only", "bob", vec![1.0, 0.0]), &bob)
        .unwrap();

    assert!(matches!(
        c.put_record(owned("catalog", "alice", vec![1.0, 0.0]), &alice),
        Err(RetrievalError::AccessDenied(_))
    ));
    assert!(matches!(
        c.put_records(
            vec![
                owned("mine", "alice", vec![1.0, 0.0]),
                owned("bob-only", "alice", vec![0.0, 1.0]),
            ],
            &alice
        ),
        Err(RetrievalError::NotFound(_))
    ));

    // Nothing moved and nothing from the rejected batch landed
    let results = c.retrieve(vec![1.0, 0.0], Some(10), &bob).unwrap();
    assert_eq!(ids(&results), vec!["bob-only", "catalog"]);
    assert_eq!(results[1].partition, Partition::Shared);
    assert!(c.list_records(&alice).unwrap().is_empty());
}

/// Store whose scans fail while `down` is set
struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
}

impl RecordStore for FlakyStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
    fn put(&self, record: EmbeddingRecord) -> Result<()> {
        self.inner.put(record)
    }
    fn get(&self, id: &RecordId) -> Result<Option<EmbeddingRecord>> {
        self.inner.get(id)
    }
    fn delete(&self, id: &RecordId) -> Result<bool> {
        self.inner.delete(id)
    }
    fn delete_in(&self, id: &RecordId, partition: &Partition) -> Result<bool> {
        self.inner.delete_in(id, partition)
    }
    fn scan(&self, partition: &Partition) -> Result<RecordScan<'_>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RetrievalError::store_unavailable("connection reset"));
        }
        self.inner.scan(partition)
    }
    fn partitions(&self) -> Result<Vec<Partition>> {
        self.inner.partitions()
    }
    fn generation(&self, partition: &Partition) -> u64 {
        self.inner.generation(partition)
    }
}

#[test]
fn test_store_outage_is_retryable() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryStore::new(2),
        down: AtomicBool::new(false),
    });
    let c = RetrievalCoordinator::without_audit(store.clone(), RetrievalConfig::new(2)).unwrap();
    c.put_record(shared("s", vec![1.0, 0.0]), &CallerIdentity::admin("curator"))
        .unwrap();

    store.down.store(true, Ordering::SeqCst);
    let caller = CallerIdentity::user("u");
    let err = c.retrieve(vec![1.0, 0.0], Some(1), &caller).unwrap_err();
    assert!(matches!(err, RetrievalError::StoreUnavailable(_)));
    assert!(err.is_retryable());

    store.down.store(false, Ordering::SeqCst);
    let results = c.retrieve(vec![1.0, 0.0], Some(1), &caller).unwrap();
    assert_eq!(ids(&results), vec!["s"]);
}

#[test]
fn test_rebuild_timeout_is_retryable() {
    let config = RetrievalConfig::new(2).with_rebuild_timeout(Duration::ZERO);
    let c = RetrievalCoordinator::without_audit(Arc::new(InMemoryStore::new(2)), config).unwrap();
    c.put_record(shared("s", vec![1.0, 0.0]), &CallerIdentity::admin("curator"))
        .unwrap();

    let err = c
        .retrieve(vec![1.0, 0.0], Some(1), &CallerIdentity::user("u"))
        .unwrap_err();
    assert!(matches!(err, RetrievalError::RebuildTimeout { .. }));
    assert!(err.is_retryable());
}

#[test]
fn test_invalid_queries() {
    let c = coordinator(2);
    let caller = CallerIdentity::user("u");
    for bad in [vec![1.0], vec![0.0, 0.0], vec![f32::NAN, 1.0], vec![f32::INFINITY, 0.0]] {
        assert!(matches!(
            c.retrieve(bad, Some(5), &caller),
            Err(RetrievalError::InvalidQuery(_))
        ));
    }
}

#[test]
fn test_unnormalized_query_is_renormalized() {
    let c = coordinator(2);
    c.put_record(shared("x", vec![1.0, 0.0]), &CallerIdentity::admin("curator"))
        .unwrap();
    let results = c
        .retrieve(vec![25.0, 0.0], Some(1), &CallerIdentity::user("u"))
        .unwrap();
    assert_eq!(results[0].score, 100.0);
}

#[test]
fn test_empty_corpus() {
    let c = coordinator(2);
    let results = c
        .retrieve(vec![1.0, 0.0], None, &CallerIdentity::user("u"))
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_rocksdb_backend_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let admin = CallerIdentity::admin("curator");
    let alice = CallerIdentity::user("alice");

    {
        let store = Arc::new(RocksDbStore::open(temp_dir.path(), 2).unwrap());
        let c = RetrievalCoordinator::without_audit(store, RetrievalConfig::new(2)).unwrap();
        c.put_records(
            vec![shared("v1", vec![1.0, 0.0]), shared("v2", vec![0.0, 1.0])],
            &admin,
        )
        .unwrap();
        c.put_record(owned("mine", "alice", vec![0.8, 0.2]), &alice)
            .unwrap();
        c.store().flush().unwrap();
    }

    // Reopen: partitions and records survive
    let store = Arc::new(RocksDbStore::open(temp_dir.path(), 2).unwrap());
    let c = RetrievalCoordinator::without_audit(store, RetrievalConfig::new(2)).unwrap();

    let results = c.retrieve(vec![1.0, 0.0], Some(3), &alice).unwrap();
    assert_eq!(ids(&results), vec!["v1", "mine", "v2"]);

    let bob = CallerIdentity::user("bob");
    let results = c.retrieve(vec![1.0, 0.0], Some(3), &bob).unwrap();
    assert_eq!(ids(&results), vec!["v1", "v2"]);

    assert_eq!(c.indexes().status(&Partition::Shared), IndexStatus::Fresh);
    c.delete_record(&RecordId::new("v1"), &admin).unwrap();
    assert_eq!(c.indexes().status(&Partition::Shared), IndexStatus::Stale);
    let results = c.retrieve(vec![1.0, 0.0], Some(3), &bob).unwrap();
    assert_eq!(ids(&results), vec!["v2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_during_ingestion() {
    let c = Arc::new(coordinator(4));
    let alice = CallerIdentity::user("alice");
    for i in 0..50 {
        c.put_record(owned(&format!("a{:03}", i), "alice", spread_vector(i)), &alice)
            .unwrap();
    }

    let writer = {
        let c = c.clone();
        let alice = alice.clone();
        tokio::task::spawn_blocking(move || {
            for i in 50..150 {
                c.put_record(owned(&format!("a{:03}", i), "alice", spread_vector(i)), &alice)
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let c = c.clone();
            let alice = alice.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..20 {
                    let results = c.retrieve(spread_vector(7), Some(10), &alice).unwrap();
                    assert_eq!(results.len(), 10);
                    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    // After the writes settle, the next query sees all of them
    let needle = spread_vector(149);
    let results = c.retrieve(needle, Some(1), &alice).unwrap();
    assert_eq!(results[0].score, 100.0);
    assert_eq!(
        c.indexes()
            .ensure_fresh(&Partition::private(OwnerId::new("alice")))
            .unwrap()
            .len(),
        150
    );
}
