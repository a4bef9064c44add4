/// Sparse term-weight retrieval, used only to boost clauses already found by
/// dense or lexical search.

use std::sync::Arc;
use std::time::Duration;

use super::terms::{sparse_tokens, MAX_SPARSE_TOKENS};
use crate::errors::RegmatchError;
use crate::store::{SparseHit, TermWeightIndex};

pub struct SparseRetriever {
    index: Arc<dyn TermWeightIndex>,
    timeout: Duration,
}

impl SparseRetriever {
    pub fn new(index: Arc<dyn TermWeightIndex>, timeout: Duration) -> Self {
        SparseRetriever { index, timeout }
    }

    /// `try_search` with failures logged and treated as no results.
    #[cfg(test)]
    pub(crate) async fn search(&self, text: &str, top_k: usize, scope: Option<&str>) -> Vec<SparseHit> {
        self.try_search(text, top_k, scope).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Sparse retrieval unavailable, skipping boosts");
            Vec::new()
        })
    }

    pub async fn try_search(
        &self,
        text: &str,
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<SparseHit>, RegmatchError> {
        let tokens = sparse_tokens(text, MAX_SPARSE_TOKENS);
        if tokens.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        match tokio::time::timeout(self.timeout, self.index.term_weights(&tokens, top_k, scope)).await {
            Ok(result) => result,
            Err(_) => Err(RegmatchError::Storage("term-weight search timed out".into())),
        }
    }
}
