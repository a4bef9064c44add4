/// Merge dense and lexical candidates and apply sparse boosts.
///
/// Insertion order is priority order: dense results first, then lexical results
/// for ids not yet seen. A lexical hit on an existing id only records its
/// lexical score. Sparse hits add `blend_weight * score` to clauses already in
/// the set and never introduce new clauses.

use std::collections::HashMap;

use crate::store::{ClauseChunk, SparseHit};

pub fn merge_candidates(
    dense: Vec<ClauseChunk>,
    lexical: Vec<ClauseChunk>,
    sparse: &[SparseHit],
    blend_weight: f64,
) -> Vec<ClauseChunk> {
    let mut merged: Vec<ClauseChunk> = Vec::with_capacity(dense.len() + lexical.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for chunk in dense.into_iter().chain(lexical) {
        match index.get(&chunk.id) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                if existing.diagnostics.lexical_score.is_none() {
                    existing.diagnostics.lexical_score = chunk.diagnostics.lexical_score;
                }
            }
            None => {
                index.insert(chunk.id.clone(), merged.len());
                merged.push(chunk);
            }
        }
    }

    let mut outside = 0usize;
    for hit in sparse {
        match index.get(&hit.clause_id) {
            Some(&pos) => {
                let boost = blend_weight * hit.score;
                let chunk = &mut merged[pos];
                chunk.score += boost;
                *chunk.diagnostics.sparse_boost.get_or_insert(0.0) += boost;
            }
            None => outside += 1,
        }
    }
    if outside > 0 {
        tracing::debug!(outside, "Sparse hits outside the candidate set were not added");
    }

    merged
}
