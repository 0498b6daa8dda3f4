//! Distance-to-score conversion and result ordering

use std::collections::HashMap;

use crate::index::Candidate;
use crate::record::{Partition, RecordId};

/// A candidate with its user-facing similarity score
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub id: RecordId,
    pub partition: Partition,
    pub distance: f32,
    /// Similarity in `[0, 100]`, two decimal places
    pub score: f32,
}

/// Similarity score for a squared Euclidean distance between unit vectors.
///
/// `max(0, 1 - distance) * 100`, rounded to two decimals. Distances of 1 or
/// more (vectors 60 degrees or further apart) all score 0.
pub fn similarity_score(distance: f32) -> f32 {
    let raw = (1.0 - distance).max(0.0) * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Merges candidates from several partitions into one ordered list
#[derive(Debug, Default, Clone, Copy)]
pub struct RankingEngine;

impl RankingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Score and order candidates by descending score, equal rounded
    /// scores by ascending id. An id seen more than once keeps its closest
    /// occurrence.
    pub fn rank(&self, candidates: Vec<Candidate>) -> Vec<RankedCandidate> {
        let mut closest: HashMap<RecordId, Candidate> = HashMap::with_capacity(candidates.len());
        for candidate in candidates {
            match closest.get(&candidate.id) {
                Some(existing) if existing.distance <= candidate.distance => {}
                _ => {
                    closest.insert(candidate.id.clone(), candidate);
                }
            }
        }

        let mut ranked: Vec<RankedCandidate> = closest
            .into_values()
            .map(|c| RankedCandidate {
                score: similarity_score(c.distance),
                id: c.id,
                partition: c.partition,
                distance: c.distance,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }
}
