//! Per-partition exact nearest-neighbour index
//!
//! Each partition gets an immutable [`IndexSnapshot`] built from a scan of
//! the record store. Snapshots are swapped in whole behind a lock, so a
//! reader sees either the previous snapshot or the new one. Rebuilds are
//! serialized per partition, and callers that queue behind a rebuild reuse
//! its result instead of scanning again.
//!
//! Distances are squared Euclidean over unit vectors. The search is a full
//! scan; corpora large enough to need approximate search need a different
//! index, not tuning of this one.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};
use crate::record::{EmbeddingRecord, Partition, RecordId};
use crate::storage::RecordStore;
use crate::vector::{self, QueryVector};

/// A nearest-neighbour hit before ranking
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: RecordId,
    pub partition: Partition,
    /// Squared Euclidean distance to the query
    pub distance: f32,
}

/// Freshness of a partition's index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    /// Never built
    Unbuilt,
    /// Reflects every store mutation up to the last build
    Fresh,
    /// The store has changed, or the partition was invalidated
    Stale,
}

/// Immutable, flat index over one partition
#[derive(Debug)]
pub struct IndexSnapshot {
    partition: Partition,
    dimension: usize,
    ids: Vec<RecordId>,
    /// Row-major, `ids.len() * dimension` components
    vectors: Vec<f32>,
    generation: u64,
    built_at: DateTime<Utc>,
    skipped: usize,
}

impl IndexSnapshot {
    fn empty(partition: Partition, dimension: usize, generation: u64) -> Self {
        Self {
            partition,
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            generation,
            built_at: Utc::now(),
            skipped: 0,
        }
    }

    fn push(&mut self, record: &EmbeddingRecord) {
        self.ids.push(record.id().clone());
        self.vectors.extend_from_slice(record.vector());
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Store generation this snapshot was built from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Records left out of this snapshot because they failed to decode or validate
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Up to `candidate_count` nearest records, ascending by distance,
    /// ties broken by ascending id.
    pub fn search(&self, query: &QueryVector, candidate_count: usize) -> Result<Vec<Candidate>> {
        if query.dimension() != self.dimension {
            return Err(RetrievalError::invalid_query(format!(
                "expected {} components, got {}",
                self.dimension,
                query.dimension()
            )));
        }
        if candidate_count == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let q = query.as_slice();
        let mut scored: Vec<(f32, usize)> = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| vector::squared_euclidean(q, row))
            .enumerate()
            .map(|(row, distance)| (distance, row))
            .collect();

        let order = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
            a.0.total_cmp(&b.0)
                .then_with(|| self.ids[a.1].cmp(&self.ids[b.1]))
        };

        if candidate_count < scored.len() {
            scored.select_nth_unstable_by(candidate_count - 1, order);
            scored.truncate(candidate_count);
        }
        scored.sort_unstable_by(order);

        Ok(scored
            .into_iter()
            .map(|(distance, row)| Candidate {
                id: self.ids[row].clone(),
                partition: self.partition.clone(),
                distance,
            })
            .collect())
    }
}

/// Index state for one partition
#[derive(Default)]
struct Slot {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    /// Set by `invalidate`; cleared when a rebuild starts
    stale: AtomicBool,
    /// Held for the duration of a rebuild
    build: Mutex<()>,
}

/// Owns every partition index and keeps them reconcilable with the store
pub struct IndexManager {
    store: Arc<dyn RecordStore>,
    dimension: usize,
    norm_tolerance: f32,
    rebuild_timeout: Option<Duration>,
    slots: DashMap<Partition, Arc<Slot>>,
    rebuilds: AtomicU64,
}

impl IndexManager {
    pub fn new(store: Arc<dyn RecordStore>, config: &RetrievalConfig) -> Self {
        Self {
            store,
            dimension: config.dimension,
            norm_tolerance: config.norm_tolerance,
            rebuild_timeout: config.rebuild_timeout,
            slots: DashMap::new(),
            rebuilds: AtomicU64::new(0),
        }
    }

    fn slot(&self, partition: &Partition) -> Arc<Slot> {
        self.slots
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone()
    }

    fn fresh_snapshot(&self, slot: &Slot, partition: &Partition) -> Option<Arc<IndexSnapshot>> {
        if slot.stale.load(AtomicOrdering::Acquire) {
            return None;
        }
        let snapshot = slot.current.read().clone()?;
        (snapshot.generation == self.store.generation(partition)).then_some(snapshot)
    }

    /// Rebuild `partition` if it is stale or unbuilt, and return the fresh snapshot.
    ///
    /// On failure the previous snapshot (if any) stays in place and keeps
    /// serving [`search`](Self::search).
    pub fn ensure_fresh(&self, partition: &Partition) -> Result<Arc<IndexSnapshot>> {
        let slot = self.slot(partition);
        if let Some(snapshot) = self.fresh_snapshot(&slot, partition) {
            log::debug!("Index for {} is fresh ({} vectors)", partition, snapshot.len());
            return Ok(snapshot);
        }

        let _build = slot.build.lock();
        // Another caller may have finished a rebuild while we waited
        if let Some(snapshot) = self.fresh_snapshot(&slot, partition) {
            return Ok(snapshot);
        }

        slot.stale.store(false, AtomicOrdering::Release);
        match self.rebuild(partition) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *slot.current.write() = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                slot.stale.store(true, AtomicOrdering::Release);
                Err(e)
            }
        }
    }

    fn rebuild(&self, partition: &Partition) -> Result<IndexSnapshot> {
        let started = Instant::now();
        let deadline = self.rebuild_timeout.map(|t| started + t);
        // Read before scanning so a concurrent mutation leaves us stale
        let generation = self.store.generation(partition);

        let mut snapshot = IndexSnapshot::empty(partition.clone(), self.dimension, generation);
        for item in self.store.scan(partition)? {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RetrievalError::RebuildTimeout {
                    partition: partition.clone(),
                    elapsed: started.elapsed(),
                });
            }

            match item.and_then(|record| self.check(partition, record)) {
                Ok(record) => snapshot.push(&record),
                Err(e @ RetrievalError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Skipping record in {} during rebuild: {}", partition, e);
                    snapshot.skipped += 1;
                }
            }
        }

        self.rebuilds.fetch_add(1, AtomicOrdering::Relaxed);
        log::info!(
            "Index for {} rebuilt with {} vectors ({} skipped) in {:?}",
            partition,
            snapshot.len(),
            snapshot.skipped,
            started.elapsed()
        );
        Ok(snapshot)
    }

    fn check(&self, partition: &Partition, record: EmbeddingRecord) -> Result<EmbeddingRecord> {
        if record.dimension() != self.dimension {
            return Err(RetrievalError::decode(
                record.id().as_str(),
                format!(
                    "dimension {} does not match {}",
                    record.dimension(),
                    self.dimension
                ),
            ));
        }
        if !vector::is_unit(record.vector(), self.norm_tolerance) {
            return Err(RetrievalError::decode(
                record.id().as_str(),
                format!("norm {} is not 1", vector::l2_norm(record.vector())),
            ));
        }
        if record.partition() != partition {
            return Err(RetrievalError::decode(
                record.id().as_str(),
                format!("belongs to {}", record.partition()),
            ));
        }
        Ok(record)
    }

    /// Search the current snapshot of `partition` without rebuilding.
    ///
    /// The snapshot may be stale; call [`ensure_fresh`](Self::ensure_fresh)
    /// first when mutations must be visible. An unbuilt partition yields
    /// no candidates.
    pub fn search(
        &self,
        partition: &Partition,
        query: &QueryVector,
        candidate_count: usize,
    ) -> Result<Vec<Candidate>> {
        match self.snapshot(partition) {
            Some(snapshot) => snapshot.search(query, candidate_count),
            None => Ok(Vec::new()),
        }
    }

    /// Mark `partition` stale; the next `ensure_fresh` rebuilds it
    pub fn invalidate(&self, partition: &Partition) {
        self.slot(partition)
            .stale
            .store(true, AtomicOrdering::Release);
    }

    pub fn invalidate_all(&self) {
        for entry in self.slots.iter() {
            entry.value().stale.store(true, AtomicOrdering::Release);
        }
    }

    /// Drop the indexes of partitions that no longer hold records. Returns
    /// how many were dropped; a dropped partition reads as unbuilt until
    /// its next `ensure_fresh`.
    pub fn prune(&self) -> Result<usize> {
        let live: HashSet<Partition> = self.store.partitions()?.into_iter().collect();
        let mut dropped = 0;
        self.slots.retain(|partition, _| {
            let keep = live.contains(partition);
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            log::debug!("Dropped {} indexes of emptied partitions", dropped);
        }
        Ok(dropped)
    }

    /// Current snapshot, fresh or not
    pub fn snapshot(&self, partition: &Partition) -> Option<Arc<IndexSnapshot>> {
        let slot = self.slots.get(partition)?.value().clone();
        let snapshot = slot.current.read().clone();
        snapshot
    }

    pub fn status(&self, partition: &Partition) -> IndexStatus {
        let Some(slot) = self.slots.get(partition).map(|e| e.value().clone()) else {
            return IndexStatus::Unbuilt;
        };
        if slot.current.read().is_none() {
            IndexStatus::Unbuilt
        } else if self.fresh_snapshot(&slot, partition).is_some() {
            IndexStatus::Fresh
        } else {
            IndexStatus::Stale
        }
    }

    /// Partitions known to the store
    pub fn partitions(&self) -> Result<Vec<Partition>> {
        self.store.partitions()
    }

    /// Number of rebuilds that ran to completion
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(AtomicOrdering::Relaxed)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
