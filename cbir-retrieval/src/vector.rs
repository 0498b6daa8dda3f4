//! Vector math and query validation
//!
//! Stored vectors and queries are unit length, which makes squared
//! Euclidean distance a monotone transform of cosine similarity:
//! `d = 2 - 2 * cos`.

use crate::error::{Result, RetrievalError};

/// Euclidean norm, accumulated in `f64` so tiny or huge components do
/// not underflow or overflow the sum of squares
fn l2_norm_f64(v: &[f32]) -> f64 {
    v.iter()
        .map(|&x| {
            let x = f64::from(x);
            x * x
        })
        .sum::<f64>()
        .sqrt()
}

/// Euclidean norm
pub fn l2_norm(v: &[f32]) -> f32 {
    l2_norm_f64(v) as f32
}

/// Scale `v` to unit length in place. Returns false (and leaves `v`
/// untouched) when the norm is zero or not finite.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm_f64(v);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x = (f64::from(*x) / norm) as f32;
    }
    true
}

/// Whether `v` has unit norm within `tolerance`
pub fn is_unit(v: &[f32], tolerance: f32) -> bool {
    (l2_norm_f64(v) - 1.0).abs() <= f64::from(tolerance)
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Validated, unit-length query vector
#[derive(Debug, Clone, PartialEq)]
pub struct QueryVector(Vec<f32>);

impl QueryVector {
    /// Validate dimension and non-degeneracy, then re-normalize.
    pub fn new(raw: Vec<f32>, dimension: usize) -> Result<Self> {
        if raw.len() != dimension {
            return Err(RetrievalError::invalid_query(format!(
                "expected {} components, got {}",
                dimension,
                raw.len()
            )));
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(RetrievalError::invalid_query(
                "query contains a non-finite component",
            ));
        }
        let mut v = raw;
        if !normalize(&mut v) {
            return Err(RetrievalError::invalid_query("query vector has zero norm"));
        }
        Ok(Self(v))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }
}
