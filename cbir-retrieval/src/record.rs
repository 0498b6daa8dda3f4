//! Embedding record types and builders
//!
//! An [`EmbeddingRecord`] pairs a unit-length feature vector with the
//! partition it lives in. The partition tag carries the owner, so a
//! shared-catalog record has no owner by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vector;

/// Stable identifier of a stored embedding
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a random identifier for uploads that arrive without one
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity that owns private records
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical grouping used for indexing and access control
///
/// Every owner gets its own private partition; the shared catalog is a
/// single partition visible to everyone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Public catalog
    Shared,
    /// Items uploaded by a single owner
    Private { owner: OwnerId },
}

impl Partition {
    pub fn private(owner: OwnerId) -> Self {
        Self::Private { owner }
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        match self {
            Self::Shared => None,
            Self::Private { owner } => Some(owner),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared)
    }

    pub fn kind(&self) -> PartitionKind {
        match self {
            Self::Shared => PartitionKind::Shared,
            Self::Private { .. } => PartitionKind::Private,
        }
    }

    /// Stable textual form, also used as the storage key segment
    pub fn segment(&self) -> String {
        match self {
            Self::Shared => "shared".to_string(),
            Self::Private { owner } => format!("private:{}", owner),
        }
    }

    /// Inverse of [`Partition::segment`]
    pub fn from_segment(segment: &str) -> Option<Self> {
        if segment == "shared" {
            return Some(Self::Shared);
        }
        segment
            .strip_prefix("private:")
            .filter(|owner| !owner.is_empty())
            .map(|owner| Self::private(OwnerId::new(owner)))
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segment())
    }
}

/// Partition tag without the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Private,
    Shared,
}

/// Display metadata carried alongside a vector; never used for scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Path of the source image, `/`-separated
    pub source_path: String,
    /// Grouping shown to users (dataset folder, "user_uploads", ...)
    #[serde(default)]
    pub category: Option<String>,
}

impl Provenance {
    pub fn new(source_path: impl Into<String>, category: Option<String>) -> Self {
        Self {
            source_path: source_path.into(),
            category,
        }
    }

    /// Derive provenance from a dataset-relative path.
    ///
    /// Backslashes are normalized and the category is the name of the
    /// directory directly containing the file.
    pub fn from_path(path: &str) -> Self {
        let source_path = path.replace('\\', "/");
        let category = source_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .and_then(|dir| dir.rsplit('/').next())
            .filter(|c| !c.is_empty())
            .map(String::from);
        Self {
            source_path,
            category,
        }
    }
}

/// A stored, unit-normalized embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    id: RecordId,
    vector: Vec<f32>,
    partition: Partition,
    provenance: Provenance,
    created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// Create a new builder for EmbeddingRecord
    pub fn builder() -> EmbeddingRecordBuilder {
        EmbeddingRecordBuilder::new()
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Owner reference; `None` for shared-catalog records
    pub fn owner(&self) -> Option<&OwnerId> {
        self.partition.owner()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Builder for EmbeddingRecord with fluent API
#[derive(Debug, Default)]
pub struct EmbeddingRecordBuilder {
    id: Option<RecordId>,
    vector: Option<Vec<f32>>,
    partition: Option<Partition>,
    provenance: Option<Provenance>,
    created_at: Option<DateTime<Utc>>,
}

impl EmbeddingRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Raw feature vector; normalized once in [`build`](Self::build)
    pub fn vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Place the record in the shared catalog
    pub fn shared(self) -> Self {
        self.partition(Partition::Shared)
    }

    /// Place the record in `owner`'s private partition
    pub fn owned_by(self, owner: OwnerId) -> Self {
        self.partition(Partition::private(owner))
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Shorthand for [`Provenance::from_path`]
    pub fn source_path(self, path: &str) -> Self {
        self.provenance(Provenance::from_path(path))
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the record, normalizing its vector to unit length
    pub fn build(self) -> Result<EmbeddingRecord, RecordBuilderError> {
        let id = self.id.ok_or(RecordBuilderError::MissingId)?;
        let mut vector = self.vector.ok_or(RecordBuilderError::MissingVector)?;
        let partition = self.partition.ok_or(RecordBuilderError::MissingPartition)?;

        if vector.is_empty() {
            return Err(RecordBuilderError::EmptyVector);
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(RecordBuilderError::NonFiniteComponent);
        }
        if !vector::normalize(&mut vector) {
            return Err(RecordBuilderError::ZeroNorm);
        }

        let provenance = self
            .provenance
            .unwrap_or_else(|| Provenance::new(id.as_str(), None));

        Ok(EmbeddingRecord {
            id,
            vector,
            partition,
            provenance,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Errors that can occur when building an EmbeddingRecord
#[derive(Debug, thiserror::Error)]
pub enum RecordBuilderError {
    #[error("Missing required field: id")]
    MissingId,
    #[error("Missing required field: vector")]
    MissingVector,
    #[error("Missing required field: partition")]
    MissingPartition,
    #[error("Vector is empty")]
    EmptyVector,
    #[error("Vector contains a non-finite component")]
    NonFiniteComponent,
    #[error("Vector has zero norm")]
    ZeroNorm,
}
