//! CBIR Retrieval Engine
//!
//! Similarity retrieval over image embeddings with per-owner privacy.
//! Embeddings produced by an external model are stored as unit vectors,
//! indexed per partition for exact nearest-neighbour search, ranked by a
//! similarity score, and filtered so that private uploads are only ever
//! returned to their owner or an administrator.
//!
//! ## Features
//!
//! - **Exact search** - Flat squared-Euclidean index per partition, deterministic tie-breaks
//! - **Staleness tracking** - Indexes are rebuilt only after the store changes
//! - **Partial-failure isolation** - Corrupt records are skipped, never fatal
//! - **RocksDB persistence** - LZ4-compressed bincode records with versioned migrations
//!
//! ## Example
//!
//! ```ignore
//! use cbir_retrieval::{
//!     CallerIdentity, EmbeddingRecord, InMemoryAuditLog, RetrievalConfig, RetrievalCoordinator,
//!     RocksDbStore,
//! };
//!
//! let store = Arc::new(RocksDbStore::open(&db_path, 512)?);
//! let coordinator =
//!     RetrievalCoordinator::new(store, Arc::new(InMemoryAuditLog::new()), RetrievalConfig::new(512))?;
//!
//! let admin = CallerIdentity::admin("curator");
//! let record = EmbeddingRecord::builder()
//!     .id("animals/cats/001.jpg")
//!     .vector(features)
//!     .shared()
//!     .source_path("animals/cats/001.jpg")
//!     .build()?;
//! coordinator.put_record(record, &admin)?;
//!
//! let results = coordinator.retrieve(query, Some(10), &CallerIdentity::user("alice"))?;
//! ```

pub mod access;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extractor;
pub mod index;
pub mod migration;
pub mod ranking;
pub mod record;
pub mod rocks;
pub mod storage;
pub mod vector;

// Re-exports for convenience
pub use access::{CallerIdentity, Role};
pub use audit::{InMemoryAuditLog, NoopAudit, SearchAudit, SearchEvent};
pub use config::RetrievalConfig;
pub use coordinator::{CorpusStats, PartitionStatus, RankedResult, RetrievalCoordinator};
pub use error::{Result, RetrievalError};
pub use extractor::{EmbeddingExtractor, ExtractionError};
pub use index::{Candidate, IndexManager, IndexSnapshot, IndexStatus};
pub use ranking::{similarity_score, RankedCandidate, RankingEngine};
pub use record::{
    EmbeddingRecord, EmbeddingRecordBuilder, OwnerId, Partition, PartitionKind, Provenance,
    RecordBuilderError, RecordId,
};
pub use rocks::RocksDbStore;
pub use storage::{InMemoryStore, RecordScan, RecordStore};
pub use vector::QueryVector;
