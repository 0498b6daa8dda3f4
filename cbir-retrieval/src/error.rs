//! Error types for cbir-retrieval

use std::time::Duration;

use thiserror::Error;

use crate::record::{Partition, RecordBuilderError};

/// Errors that can occur in the retrieval engine
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Vector length differs from the deployment dimension
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Stored vector is not unit length
    #[error("Record {id} is not normalized (norm {norm})")]
    NotNormalized { id: String, norm: f32 },

    /// Query vector was rejected before any index work
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A stored record could not be decoded or failed validation
    #[error("Record decode error for {id}: {reason}")]
    RecordDecode { id: String, reason: String },

    /// Index rebuild exceeded the configured budget
    #[error("Index rebuild for {partition} timed out after {elapsed:?}")]
    RebuildTimeout {
        partition: Partition,
        elapsed: Duration,
    },

    /// Backing store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Record not found (or not visible to the caller)
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Caller lacks the role required for the operation
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Embedding extractor failed
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Builder error
    #[error("Builder error: {0}")]
    Builder(#[from] RecordBuilderError),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for RetrievalError {
    fn from(err: rocksdb::Error) -> Self {
        Self::StoreUnavailable(err.into_string())
    }
}

impl RetrievalError {
    /// Create an invalid query error
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Create a record decode error
    pub fn decode(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RecordDecode {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create an access denied error
    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RebuildTimeout { .. } | Self::StoreUnavailable(_)
        )
    }
}

/// Result type for retrieval operations
pub type Result<T> = std::result::Result<T, RetrievalError>;
