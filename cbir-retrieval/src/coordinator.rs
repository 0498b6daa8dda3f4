//! Retrieval coordinator
//!
//! Composes the record store, the per-partition indexes, ranking and the
//! access filter into the externally visible operations.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::access::{self, CallerIdentity};
use crate::audit::{NoopAudit, SearchAudit, SearchEvent};
use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};
use crate::extractor::EmbeddingExtractor;
use crate::index::{IndexManager, IndexStatus};
use crate::ranking::RankingEngine;
use crate::record::{EmbeddingRecord, Partition, PartitionKind, Provenance, RecordId};
use crate::storage::RecordStore;
use crate::vector::QueryVector;

/// One entry of a retrieval response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub id: RecordId,
    pub partition: Partition,
    /// Similarity in `[0, 100]`
    pub score: f32,
    /// Squared Euclidean distance to the query
    pub distance: f32,
    pub provenance: Provenance,
}

/// Index state of one partition
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition: Partition,
    pub status: IndexStatus,
    /// Vectors in the current snapshot, if one was ever built
    pub indexed: Option<usize>,
}

/// Corpus and usage statistics
#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub shared_records: usize,
    pub private_records: usize,
    /// Records created within the configured recent window
    pub recent_records: usize,
    /// Stored entries that could not be decoded
    pub unreadable_records: usize,
    /// `None` when the audit sink cannot count
    pub total_searches: Option<usize>,
    pub recent_searches: Option<usize>,
    pub indexes: Vec<PartitionStatus>,
}

/// Serves retrieval and record management for authenticated callers
pub struct RetrievalCoordinator {
    config: RetrievalConfig,
    store: Arc<dyn RecordStore>,
    indexes: IndexManager,
    ranking: RankingEngine,
    audit: Arc<dyn SearchAudit>,
}

impl RetrievalCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        audit: Arc<dyn SearchAudit>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        if store.dimension() != config.dimension {
            return Err(RetrievalError::invalid_config(format!(
                "store dimension {} does not match configured dimension {}",
                store.dimension(),
                config.dimension
            )));
        }

        let indexes = IndexManager::new(store.clone(), &config);
        Ok(Self {
            config,
            store,
            indexes,
            ranking: RankingEngine::new(),
            audit,
        })
    }

    /// Coordinator that does not keep an audit trail
    pub fn without_audit(store: Arc<dyn RecordStore>, config: RetrievalConfig) -> Result<Self> {
        Self::new(store, Arc::new(NoopAudit), config)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Partitions searched on behalf of `caller`
    fn partitions_for(&self, caller: &CallerIdentity) -> Result<Vec<Partition>> {
        let mut partitions = vec![caller.private_partition(), Partition::Shared];
        if caller.is_admin() {
            for partition in self.store.partitions()? {
                if !partitions.contains(&partition) {
                    partitions.push(partition);
                }
            }
        }
        Ok(partitions)
    }

    /// Nearest records to `query` that `caller` may see, best first.
    ///
    /// `top_k` defaults to `default_top_k` and is clamped to `max_top_k`.
    /// Fewer than `top_k` results means the visible corpus has no more.
    pub fn retrieve(
        &self,
        query: Vec<f32>,
        top_k: Option<usize>,
        caller: &CallerIdentity,
    ) -> Result<Vec<RankedResult>> {
        let query = QueryVector::new(query, self.config.dimension)?;
        let top_k = self
            .config
            .clamp_top_k(top_k.unwrap_or(self.config.default_top_k));

        let results = if top_k == 0 {
            Vec::new()
        } else {
            self.collect_results(&query, top_k, caller)?
        };

        self.record_search(caller, results.len());
        Ok(results)
    }

    fn collect_results(
        &self,
        query: &QueryVector,
        top_k: usize,
        caller: &CallerIdentity,
    ) -> Result<Vec<RankedResult>> {
        let mut candidates = Vec::new();
        for partition in self.partitions_for(caller)? {
            let snapshot = self.indexes.ensure_fresh(&partition)?;
            let over_fetch = top_k
                .saturating_mul(self.config.over_fetch_factor)
                .min(snapshot.len());
            let hits = snapshot.search(query, over_fetch)?;
            log::debug!("{} candidates from {}", hits.len(), partition);
            candidates.extend(hits);
        }

        let mut results = Vec::with_capacity(top_k);
        for candidate in self.ranking.rank(candidates) {
            if results.len() == top_k {
                break;
            }

            let record = match self.store.get(&candidate.id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    log::debug!("{} was deleted after indexing", candidate.id);
                    continue;
                }
                Err(e @ RetrievalError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Skipping unreadable record {}: {}", candidate.id, e);
                    continue;
                }
            };
            if !access::visible(&record, caller) {
                continue;
            }

            results.push(RankedResult {
                id: candidate.id,
                partition: record.partition().clone(),
                score: candidate.score,
                distance: candidate.distance,
                provenance: record.provenance().clone(),
            });
        }
        Ok(results)
    }

    fn record_search(&self, caller: &CallerIdentity, results_count: usize) {
        let event = SearchEvent::new(caller.id.clone(), results_count);
        if let Err(e) = self.audit.record_search(event) {
            log::warn!("Failed to record search for {}: {}", caller.id, e);
        }
    }

    fn extract(&self, extractor: &dyn EmbeddingExtractor, image: &[u8]) -> Result<Vec<f32>> {
        if extractor.dimension() != self.config.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.config.dimension,
                found: extractor.dimension(),
            });
        }
        Ok(extractor.extract(image)?)
    }

    /// Embed `image` and retrieve its nearest visible records
    pub fn retrieve_by_image(
        &self,
        extractor: &dyn EmbeddingExtractor,
        image: &[u8],
        top_k: Option<usize>,
        caller: &CallerIdentity,
    ) -> Result<Vec<RankedResult>> {
        let vector = self.extract(extractor, image)?;
        self.retrieve(vector, top_k, caller)
    }

    /// Embed `image` and store it in the caller's private partition
    pub fn ingest_upload(
        &self,
        extractor: &dyn EmbeddingExtractor,
        image: &[u8],
        caller: &CallerIdentity,
        provenance: Provenance,
    ) -> Result<RecordId> {
        let vector = self.extract(extractor, image)?;
        let record = EmbeddingRecord::builder()
            .id(RecordId::generate())
            .vector(vector)
            .owned_by(caller.id.clone())
            .provenance(provenance)
            .build()?;

        let id = record.id().clone();
        self.store.put(record)?;
        log::info!("Ingested upload {} for {}", id, caller.id);
        Ok(id)
    }

    /// Insert or replace a pre-built record
    pub fn put_record(&self, record: EmbeddingRecord, caller: &CallerIdentity) -> Result<()> {
        self.check_writable(&record, caller)?;
        self.store.put(record)
    }

    /// Insert or replace several records; nothing is written if any is rejected
    pub fn put_records(&self, records: Vec<EmbeddingRecord>, caller: &CallerIdentity) -> Result<()> {
        for record in &records {
            self.check_writable(record, caller)?;
        }
        let count = records.len();
        self.store.put_batch(records)?;
        log::info!("Imported {} records for {}", count, caller.id);
        Ok(())
    }

    /// The caller must be allowed to write the incoming record and, since
    /// a put replaces by id, the record it would replace.
    fn check_writable(&self, record: &EmbeddingRecord, caller: &CallerIdentity) -> Result<()> {
        if !access::can_modify(record, caller) {
            return Err(RetrievalError::access_denied(format!(
                "{} may not write to {}",
                caller.id,
                record.partition()
            )));
        }
        if caller.is_admin() {
            return Ok(());
        }

        match self.store.get(record.id())? {
            Some(existing) if !access::visible(&existing, caller) => {
                Err(RetrievalError::not_found(record.id().as_str()))
            }
            Some(existing) if !access::can_modify(&existing, caller) => {
                Err(RetrievalError::access_denied(format!(
                    "{} may not replace {}",
                    caller.id,
                    record.id()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Fetch a record the caller can see
    pub fn get_record(&self, id: &RecordId, caller: &CallerIdentity) -> Result<EmbeddingRecord> {
        match self.store.get(id)? {
            Some(record) if access::visible(&record, caller) => Ok(record),
            _ => Err(RetrievalError::not_found(id.as_str())),
        }
    }

    /// Delete a record owned by the caller (any record, for admins)
    pub fn delete_record(&self, id: &RecordId, caller: &CallerIdentity) -> Result<()> {
        let record = self.get_record(id, caller)?;
        if !access::can_modify(&record, caller) {
            return Err(RetrievalError::access_denied(format!(
                "{} may not delete {}",
                caller.id, id
            )));
        }

        // Only where the permission check saw it
        if !self.store.delete_in(id, record.partition())? {
            return Err(RetrievalError::not_found(id.as_str()));
        }
        log::info!("Deleted {} from {}", id, record.partition());

        if let Err(e) = self.indexes.prune() {
            log::warn!("Failed to prune indexes after deleting {}: {}", id, e);
        }
        Ok(())
    }

    /// The caller's private records, or every private record for an admin,
    /// newest first
    pub fn list_records(&self, caller: &CallerIdentity) -> Result<Vec<EmbeddingRecord>> {
        let partitions: Vec<Partition> = if caller.is_admin() {
            self.store
                .partitions()?
                .into_iter()
                .filter(|p| !p.is_shared())
                .collect()
        } else {
            vec![caller.private_partition()]
        };

        let mut records = Vec::new();
        for partition in &partitions {
            for item in self.store.scan(partition)? {
                match item {
                    Ok(record) => records.push(record),
                    Err(e @ RetrievalError::StoreUnavailable(_)) => return Err(e),
                    Err(e) => log::warn!("Skipping record in {}: {}", partition, e),
                }
            }
        }

        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(records)
    }

    /// Corpus statistics; admin only
    pub fn stats(&self, caller: &CallerIdentity) -> Result<CorpusStats> {
        if !caller.is_admin() {
            return Err(RetrievalError::access_denied("statistics require admin"));
        }

        let since = Utc::now() - self.config.recent_window;
        let mut stats = CorpusStats {
            shared_records: 0,
            private_records: 0,
            recent_records: 0,
            unreadable_records: 0,
            total_searches: self.audit.count_searches(None),
            recent_searches: self.audit.count_searches(Some(since)),
            indexes: Vec::new(),
        };

        for partition in self.store.partitions()? {
            for item in self.store.scan(&partition)? {
                let record = match item {
                    Ok(record) => record,
                    Err(e @ RetrievalError::StoreUnavailable(_)) => return Err(e),
                    Err(_) => {
                        stats.unreadable_records += 1;
                        continue;
                    }
                };
                match record.partition().kind() {
                    PartitionKind::Shared => stats.shared_records += 1,
                    PartitionKind::Private => stats.private_records += 1,
                }
                if record.created_at() >= since {
                    stats.recent_records += 1;
                }
            }

            stats.indexes.push(PartitionStatus {
                status: self.indexes.status(&partition),
                indexed: self.indexes.snapshot(&partition).map(|s| s.len()),
                partition,
            });
        }
        Ok(stats)
    }
}
