//! Reciprocal Rank Fusion of independently ranked result lists.
//!
//! Each list contributes `1 / (k + rank)` to every item it contains,
//! with `rank` starting at 1. Items are sorted by the summed score;
//! ties keep the order in which items were first seen across the
//! input lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tunable fusion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    /// RRF constant `k`.
    pub k: f64,
    /// Each sub-search fetches `limit * prefetch_multiplier` results.
    pub prefetch_multiplier: usize,
    /// ...but never fewer than this.
    pub prefetch_min: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            k: 60.0,
            prefetch_multiplier: 3,
            prefetch_min: 20,
        }
    }
}

impl FusionParams {
    /// Number of candidates each sub-search should return.
    pub fn prefetch_limit(&self, limit: usize) -> usize {
        (limit * self.prefetch_multiplier).max(self.prefetch_min)
    }
}

/// Fuse ranked id lists. Returns `(id, score)` sorted by descending score.
pub fn reciprocal_rank_fusion<S: AsRef<str>>(lists: &[Vec<S>], k: f64) -> Vec<(String, f64)> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();

    for list in lists {
        for (idx, id) in list.iter().enumerate() {
            let id = id.as_ref();
            let contribution = 1.0 / (k + (idx + 1) as f64);
            match scores.get_mut(id) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(id, contribution);
                    first_seen.push(id);
                }
            }
        }
    }

    let mut fused: Vec<(String, f64)> = first_seen
        .into_iter()
        .map(|id| (id.to_string(), scores[id]))
        .collect();
    // sort_by is stable, so equal scores keep first-seen order.
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}
