//! Embedding record storage
//!
//! [`RecordStore`] is the source of truth for embeddings. Every mutation
//! bumps a per-partition generation counter; the index manager compares
//! that counter with the generation its snapshot was built from to decide
//! whether a partition is stale.

use dashmap::DashMap;

use crate::error::{Result, RetrievalError};
use crate::record::{EmbeddingRecord, Partition, RecordId};
use crate::vector;

/// Default tolerance for the unit-norm check on `put`
pub const DEFAULT_NORM_TOLERANCE: f32 = 1e-3;

/// Restartable sequence of records in one partition. Individual items may
/// fail (corrupt entries) without ending the sequence.
pub type RecordScan<'a> = Box<dyn Iterator<Item = Result<EmbeddingRecord>> + 'a>;

/// Durable mapping from record id to embedding
pub trait RecordStore: Send + Sync {
    /// Vector dimension accepted by this store
    fn dimension(&self) -> usize;

    /// Insert or replace a record by id
    fn put(&self, record: EmbeddingRecord) -> Result<()>;

    /// Insert or replace several records. Nothing is written if any
    /// record fails validation.
    fn put_batch(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in &records {
            self.validate(record)?;
        }
        for record in records {
            self.put(record)?;
        }
        Ok(())
    }

    /// Look up a record by id
    fn get(&self, id: &RecordId) -> Result<Option<EmbeddingRecord>>;

    /// Remove a record. Returns false if it did not exist.
    fn delete(&self, id: &RecordId) -> Result<bool>;

    /// Remove a record only while it lives in `partition`. Returns false
    /// if it is missing or has moved to another partition.
    fn delete_in(&self, id: &RecordId, partition: &Partition) -> Result<bool>;

    /// Iterate over every record in `partition`
    fn scan(&self, partition: &Partition) -> Result<RecordScan<'_>>;

    /// Partitions that currently hold records
    fn partitions(&self) -> Result<Vec<Partition>>;

    /// Mutation counter for `partition`; 0 before the first mutation
    fn generation(&self, partition: &Partition) -> u64;

    /// Flush buffered writes, if the backend buffers
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Check dimension and unit norm before accepting a record
    fn validate(&self, record: &EmbeddingRecord) -> Result<()> {
        validate_record(record, self.dimension(), DEFAULT_NORM_TOLERANCE)
    }
}

/// Reject records whose dimension or norm would corrupt distance math
pub fn validate_record(record: &EmbeddingRecord, dimension: usize, tolerance: f32) -> Result<()> {
    if record.dimension() != dimension {
        return Err(RetrievalError::DimensionMismatch {
            expected: dimension,
            found: record.dimension(),
        });
    }
    if !vector::is_unit(record.vector(), tolerance) {
        return Err(RetrievalError::NotNormalized {
            id: record.id().to_string(),
            norm: vector::l2_norm(record.vector()),
        });
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct PartitionCounters {
    generation: u64,
    records: usize,
}

/// Per-partition mutation counters and record counts shared by the store
/// implementations.
///
/// Counters are never dropped, even for emptied partitions: a partition
/// that empties and refills must not repeat a generation an index
/// snapshot was built from.
#[derive(Debug, Default)]
pub(crate) struct Generations {
    counters: DashMap<Partition, PartitionCounters>,
}

impl Generations {
    /// Count a record found on open without marking the partition mutated
    pub(crate) fn load(&self, partition: &Partition) {
        self.counters.entry(partition.clone()).or_default().records += 1;
    }

    /// A record was replaced in place
    pub(crate) fn bump(&self, partition: &Partition) {
        self.counters.entry(partition.clone()).or_default().generation += 1;
    }

    pub(crate) fn added(&self, partition: &Partition) {
        let mut counters = self.counters.entry(partition.clone()).or_default();
        counters.generation += 1;
        counters.records += 1;
    }

    pub(crate) fn removed(&self, partition: &Partition) {
        let mut counters = self.counters.entry(partition.clone()).or_default();
        counters.generation += 1;
        counters.records = counters.records.saturating_sub(1);
    }

    pub(crate) fn get(&self, partition: &Partition) -> u64 {
        self.counters
            .get(partition)
            .map(|c| c.generation)
            .unwrap_or(0)
    }

    /// Partitions holding at least one record, sorted
    pub(crate) fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self
            .counters
            .iter()
            .filter(|e| e.value().records > 0)
            .map(|e| e.key().clone())
            .collect();
        partitions.sort();
        partitions
    }
}

/// Volatile store backed by a `DashMap`, for tests and ephemeral deployments
pub struct InMemoryStore {
    dimension: usize,
    norm_tolerance: f32,
    records: DashMap<RecordId, EmbeddingRecord>,
    generations: Generations,
}

impl InMemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            norm_tolerance: DEFAULT_NORM_TOLERANCE,
            records: DashMap::new(),
            generations: Generations::default(),
        }
    }

    pub fn with_norm_tolerance(mut self, tolerance: f32) -> Self {
        self.norm_tolerance = tolerance;
        self
    }

    /// Total number of records across all partitions
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for InMemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn put(&self, record: EmbeddingRecord) -> Result<()> {
        self.validate(&record)?;

        let partition = record.partition().clone();
        let previous = self.records.insert(record.id().clone(), record);

        // Write first, then bump: a rebuild that read the old generation
        // is guaranteed to be considered stale afterwards.
        match previous {
            None => self.generations.added(&partition),
            Some(prev) if prev.partition() != &partition => {
                self.generations.removed(prev.partition());
                self.generations.added(&partition);
            }
            Some(_) => self.generations.bump(&partition),
        }
        Ok(())
    }

    fn get(&self, id: &RecordId) -> Result<Option<EmbeddingRecord>> {
        Ok(self.records.get(id).map(|e| e.value().clone()))
    }

    fn delete(&self, id: &RecordId) -> Result<bool> {
        match self.records.remove(id) {
            Some((_, removed)) => {
                self.generations.removed(removed.partition());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_in(&self, id: &RecordId, partition: &Partition) -> Result<bool> {
        match self
            .records
            .remove_if(id, |_, record| record.partition() == partition)
        {
            Some(_) => {
                self.generations.removed(partition);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn scan(&self, partition: &Partition) -> Result<RecordScan<'_>> {
        let records: Vec<EmbeddingRecord> = self
            .records
            .iter()
            .filter(|e| e.value().partition() == partition)
            .map(|e| e.value().clone())
            .collect();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn partitions(&self) -> Result<Vec<Partition>> {
        Ok(self.generations.partitions())
    }

    fn generation(&self, partition: &Partition) -> u64 {
        self.generations.get(partition)
    }

    fn validate(&self, record: &EmbeddingRecord) -> Result<()> {
        validate_record(record, self.dimension, self.norm_tolerance)
    }
}
