//! Boundary to the external embedding model
//!
//! The engine never decodes images itself. An [`EmbeddingExtractor`] turns
//! uploaded bytes into a raw feature vector; normalization happens on our
//! side of the boundary.

use thiserror::Error;

use crate::error::RetrievalError;

/// Failure reported by an extractor
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Payload is not an image the model can read
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),

    /// Model failed while running
    #[error("Model failure: {0}")]
    Model(String),
}

impl From<ExtractionError> for RetrievalError {
    fn from(err: ExtractionError) -> Self {
        RetrievalError::Extraction(err.to_string())
    }
}

/// Produces a fixed-length feature vector from raw image bytes
pub trait EmbeddingExtractor: Send + Sync {
    /// Length of every vector returned by [`extract`](Self::extract)
    fn dimension(&self) -> usize;

    fn extract(&self, image: &[u8]) -> std::result::Result<Vec<f32>, ExtractionError>;
}
