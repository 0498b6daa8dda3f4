//! RocksDB-backed record store
//!
//! Key layout:
//! - `rec\0<partition>\0<id>` → bincode-encoded [`EmbeddingRecord`]
//! - `loc\0<id>` → partition segment, so lookups by id need no scan
//! - `_db_version` → schema version (see [`crate::migration`])
//!
//! Records of one partition are contiguous, so a partition scan is a
//! single prefix iteration.

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, RetrievalError};
use crate::record::{EmbeddingRecord, Partition, RecordId};
use crate::storage::{validate_record, Generations, RecordScan, RecordStore, DEFAULT_NORM_TOLERANCE};

const RECORD_PREFIX: &[u8] = b"rec\0";
const LOCATION_PREFIX: &[u8] = b"loc\0";

fn partition_prefix(partition: &Partition) -> Vec<u8> {
    let segment = partition.segment();
    let mut key = Vec::with_capacity(RECORD_PREFIX.len() + segment.len() + 1);
    key.extend_from_slice(RECORD_PREFIX);
    key.extend_from_slice(segment.as_bytes());
    key.push(0);
    key
}

fn record_key(partition: &Partition, id: &RecordId) -> Vec<u8> {
    let mut key = partition_prefix(partition);
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

fn location_key(id: &RecordId) -> Vec<u8> {
    let mut key = LOCATION_PREFIX.to_vec();
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

/// Partition segment encoded in a record key
fn segment_of(key: &[u8]) -> Option<&str> {
    let rest = key.strip_prefix(RECORD_PREFIX)?;
    let end = rest.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

/// Where a record lived before a staged write
enum Previous {
    Absent,
    Same,
    Moved(Partition),
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<EmbeddingRecord> {
    bincode::deserialize::<EmbeddingRecord>(value)
        .map_err(|e| RetrievalError::decode(String::from_utf8_lossy(key), e.to_string()))
}

/// Persistent store with LZ4-compressed RocksDB
pub struct RocksDbStore {
    db: Arc<DB>,
    dimension: usize,
    norm_tolerance: f32,
    generations: Generations,
    /// Serializes location lookup + write for put/delete
    write_lock: Mutex<()>,
}

impl RocksDbStore {
    /// Open (or create) a store at `path`, migrating older layouts first
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        crate::migration::migrate_if_needed(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        crate::migration::stamp_version(&db)?;

        log::info!("RecordStore opened at: {}", path.display());

        let store = Self {
            db: Arc::new(db),
            dimension,
            norm_tolerance: DEFAULT_NORM_TOLERANCE,
            generations: Generations::default(),
            write_lock: Mutex::new(()),
        };
        store.load_partitions()?;
        Ok(store)
    }

    pub fn with_norm_tolerance(mut self, tolerance: f32) -> Self {
        self.norm_tolerance = tolerance;
        self
    }

    /// Register every partition present on disk. Only keys are parsed, so
    /// a corrupt value cannot prevent the store from opening.
    fn load_partitions(&self) -> Result<()> {
        let mut count = 0usize;
        let iter = self
            .db
            .iterator(IteratorMode::From(RECORD_PREFIX, Direction::Forward));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(RECORD_PREFIX) {
                break;
            }
            match segment_of(&key).and_then(Partition::from_segment) {
                Some(partition) => {
                    self.generations.load(&partition);
                    count += 1;
                }
                None => log::warn!(
                    "Unrecognized record key {}. Skipping.",
                    String::from_utf8_lossy(&key)
                ),
            }
        }

        if count > 0 {
            log::info!(
                "Found {} records in {} partitions",
                count,
                self.generations.partitions().len()
            );
        }
        Ok(())
    }

    fn location_of(&self, id: &RecordId) -> Result<Option<Partition>> {
        let Some(bytes) = self.db.get(location_key(id))? else {
            return Ok(None);
        };
        let segment = String::from_utf8_lossy(&bytes);
        Partition::from_segment(&segment)
            .map(Some)
            .ok_or_else(|| RetrievalError::decode(id.as_str(), format!("bad location {}", segment)))
    }

    /// Stage `record` into `batch`. `staged` holds the partitions of ids
    /// already written earlier in the same batch, which the database
    /// cannot see yet.
    fn stage_put(
        &self,
        batch: &mut WriteBatch,
        record: &EmbeddingRecord,
        staged: &HashMap<RecordId, Partition>,
    ) -> Result<Previous> {
        let partition = record.partition();
        if partition.segment().contains('\0') {
            return Err(RetrievalError::other("owner id must not contain NUL"));
        }

        let located = match staged.get(record.id()) {
            Some(p) => Some(p.clone()),
            None => self.location_of(record.id())?,
        };
        let previous = match located {
            None => Previous::Absent,
            Some(p) if &p == partition => Previous::Same,
            Some(p) => {
                batch.delete(record_key(&p, record.id()));
                Previous::Moved(p)
            }
        };

        batch.put(record_key(partition, record.id()), bincode::serialize(record)?);
        batch.put(location_key(record.id()), partition.segment().as_bytes());
        Ok(previous)
    }

    /// Delete both keys of a record; caller holds the write lock
    fn remove(&self, id: &RecordId, partition: &Partition) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(record_key(partition, id));
        batch.delete(location_key(id));
        self.db.write(batch)?;

        self.generations.removed(partition);
        Ok(())
    }

    fn count_placement(&self, previous: Previous, partition: &Partition) {
        match previous {
            Previous::Absent => self.generations.added(partition),
            Previous::Same => self.generations.bump(partition),
            Previous::Moved(old) => {
                self.generations.removed(&old);
                self.generations.added(partition);
            }
        }
    }
}

impl RecordStore for RocksDbStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn put(&self, record: EmbeddingRecord) -> Result<()> {
        self.validate(&record)?;

        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let previous = self.stage_put(&mut batch, &record, &HashMap::new())?;
        self.db.write(batch)?;

        self.count_placement(previous, record.partition());
        Ok(())
    }

    fn put_batch(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in &records {
            self.validate(record)?;
        }

        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut staged = HashMap::with_capacity(records.len());
        let mut placements = Vec::with_capacity(records.len());
        for record in &records {
            let previous = self.stage_put(&mut batch, record, &staged)?;
            staged.insert(record.id().clone(), record.partition().clone());
            placements.push(previous);
        }
        self.db.write(batch)?;

        for (previous, record) in placements.into_iter().zip(&records) {
            self.count_placement(previous, record.partition());
        }
        log::debug!("Stored batch of {} records", records.len());
        Ok(())
    }

    fn get(&self, id: &RecordId) -> Result<Option<EmbeddingRecord>> {
        let Some(partition) = self.location_of(id)? else {
            return Ok(None);
        };
        let key = record_key(&partition, id);
        match self.db.get(&key)? {
            Some(value) => decode_record(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &RecordId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(partition) = self.location_of(id)? else {
            return Ok(false);
        };

        self.remove(id, &partition)?;
        Ok(true)
    }

    fn delete_in(&self, id: &RecordId, partition: &Partition) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.location_of(id)?.as_ref() != Some(partition) {
            return Ok(false);
        }

        self.remove(id, partition)?;
        Ok(true)
    }

    fn scan(&self, partition: &Partition) -> Result<RecordScan<'_>> {
        let prefix = partition_prefix(partition);
        let expected = partition.clone();
        let iter = self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward));

        let scan = iter
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            })
            .map(move |item| {
                let (key, value) = item?;
                let record = decode_record(&key, &value)?;
                if record.partition() != &expected {
                    return Err(RetrievalError::decode(
                        record.id().as_str(),
                        format!("stored under {} but tagged {}", expected, record.partition()),
                    ));
                }
                Ok(record)
            });
        Ok(Box::new(scan))
    }

    fn partitions(&self) -> Result<Vec<Partition>> {
        Ok(self.generations.partitions())
    }

    fn generation(&self, partition: &Partition) -> u64 {
        self.generations.get(partition)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn validate(&self, record: &EmbeddingRecord) -> Result<()> {
        validate_record(record, self.dimension, self.norm_tolerance)
    }
}
