//! Retrieval configuration

use std::time::Duration;

use crate::error::{Result, RetrievalError};

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Embedding dimension for this deployment (default: 512)
    pub dimension: usize,
    /// Upper bound applied to every requested `top_k` (default: 200)
    pub max_top_k: usize,
    /// `top_k` used when the caller does not pass one (default: 10)
    pub default_top_k: usize,
    /// Candidates fetched per partition are `top_k * over_fetch_factor` (default: 2)
    pub over_fetch_factor: usize,
    /// Allowed deviation of a stored vector's norm from 1 (default: 1e-3)
    pub norm_tolerance: f32,
    /// Budget for a single partition rebuild; `None` is unbounded
    pub rebuild_timeout: Option<Duration>,
    /// Window counted as "recent" in statistics (default: 7 days)
    pub recent_window: chrono::Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dimension: 512,
            max_top_k: 200,
            default_top_k: 10,
            over_fetch_factor: 2,
            norm_tolerance: 1e-3,
            rebuild_timeout: None,
            recent_window: chrono::Duration::days(7),
        }
    }
}

impl RetrievalConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k;
        self
    }

    pub fn with_default_top_k(mut self, default_top_k: usize) -> Self {
        self.default_top_k = default_top_k;
        self
    }

    pub fn with_over_fetch_factor(mut self, factor: usize) -> Self {
        self.over_fetch_factor = factor;
        self
    }

    pub fn with_norm_tolerance(mut self, tolerance: f32) -> Self {
        self.norm_tolerance = tolerance;
        self
    }

    pub fn with_rebuild_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_timeout = Some(timeout);
        self
    }

    pub fn with_recent_window(mut self, window: chrono::Duration) -> Self {
        self.recent_window = window;
        self
    }

    /// Clamp a requested result count to `max_top_k`
    pub fn clamp_top_k(&self, top_k: usize) -> usize {
        top_k.min(self.max_top_k)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(RetrievalError::invalid_config("dimension must be positive"));
        }
        if self.max_top_k == 0 {
            return Err(RetrievalError::invalid_config("max_top_k must be positive"));
        }
        if self.over_fetch_factor == 0 {
            return Err(RetrievalError::invalid_config(
                "over_fetch_factor must be positive",
            ));
        }
        if self.norm_tolerance.is_nan() || self.norm_tolerance <= 0.0 {
            return Err(RetrievalError::invalid_config(
                "norm_tolerance must be positive",
            ));
        }
        Ok(())
    }
}
