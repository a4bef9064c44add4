/// Stage 2 rerank: token-level late interaction (MaxSim).
///
/// Query and clause text are split into tokens, each token is embedded through
/// the shared embedding cache, and a clause scores
/// `Σ_q max(0, max_d cos(q, d))` over its tokens. Tokens that fail to embed are
/// left out of the sum. If no query token can be embedded the stage 1 order is
/// kept.

use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::search::terms::tokenize;
use crate::store::ClauseChunk;

pub const MAX_QUERY_TOKENS: usize = 32;
pub const MAX_DOC_TOKENS: usize = 64;

/// Token embeddings requested concurrently.
const EMBED_CONCURRENCY: usize = 16;

/// MaxSim score of a document against a query, both given as token vectors.
///
/// Each query token contributes its best non-negative cosine against any
/// document token; an empty side scores 0.
pub fn max_sim<Q, D>(query: &[Q], doc: &[D]) -> f64
where
    Q: AsRef<[f32]>,
    D: AsRef<[f32]>,
{
    if doc.is_empty() {
        return 0.0;
    }
    query
        .iter()
        .map(|q| {
            doc.iter()
                .map(|d| cosine_similarity(q.as_ref(), d.as_ref()))
                .fold(0.0f64, f64::max)
        })
        .sum()
}

pub struct LateInteractionReranker {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl LateInteractionReranker {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        LateInteractionReranker { embedder }
    }

    /// Embed each distinct token once; failures are logged and skipped.
    async fn embed_tokens<'a>(&self, tokens: impl Iterator<Item = &'a String>) -> HashMap<String, Vec<f32>> {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = tokens.filter(|t| seen.insert(t.to_string())).cloned().collect();

        let mut vectors = HashMap::with_capacity(distinct.len());
        for batch in distinct.chunks(EMBED_CONCURRENCY) {
            let results = join_all(batch.iter().map(|token| async move {
                (token, self.embedder.embed(token).await)
            }))
            .await;

            for (token, result) in results {
                match result {
                    Ok(vector) => {
                        vectors.insert(token.clone(), vector);
                    }
                    Err(e) => tracing::debug!(token = %token, error = %e, "Token embedding failed"),
                }
            }
        }
        vectors
    }

    /// Rescore `candidates` by MaxSim, sort descending (stable) and keep `top_k`.
    pub async fn rerank(&self, query: &str, mut candidates: Vec<ClauseChunk>, top_k: usize) -> Vec<ClauseChunk> {
        let query_tokens: Vec<String> = tokenize(query).into_iter().take(MAX_QUERY_TOKENS).collect();
        if candidates.is_empty() || query_tokens.is_empty() {
            candidates.truncate(top_k);
            return candidates;
        }

        let query_vectors = self.embed_tokens(query_tokens.iter()).await;
        if query_vectors.is_empty() {
            tracing::warn!("Query tokens could not be embedded, keeping stage 1 order");
            candidates.truncate(top_k);
            return candidates;
        }
        let query_matrix: Vec<&Vec<f32>> = query_tokens.iter().filter_map(|t| query_vectors.get(t)).collect();

        let doc_tokens: Vec<Vec<String>> = candidates
            .iter()
            .map(|c| tokenize(&c.content).into_iter().take(MAX_DOC_TOKENS).collect())
            .collect();
        let doc_vectors = self.embed_tokens(doc_tokens.iter().flatten()).await;

        for (chunk, tokens) in candidates.iter_mut().zip(&doc_tokens) {
            let doc_matrix: Vec<&Vec<f32>> = tokens.iter().filter_map(|t| doc_vectors.get(t)).collect();
            let score = max_sim(&query_matrix, &doc_matrix);
            chunk.diagnostics.late_interaction_score = Some(score);
            chunk.score = score;
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k);
        candidates
    }
}
