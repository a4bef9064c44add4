/// Dense retrieval over an ordered chain of vector backends.
///
/// Backends are tried in priority order (local store, then remote index) until
/// `top_k` distinct clauses are collected. A backend that errors or exceeds the
/// timeout is skipped. Only when every backend failed does `try_search` return
/// an error; `search` turns that into an empty list.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::RegmatchError;
use crate::store::{ClauseChunk, DenseBackend};

pub struct DenseRetriever {
    backends: Vec<Arc<dyn DenseBackend>>,
    timeout: Duration,
}

impl DenseRetriever {
    pub fn new(backends: Vec<Arc<dyn DenseBackend>>, timeout: Duration) -> Self {
        DenseRetriever { backends, timeout }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// `try_search` with failures logged and treated as no results.
    #[cfg(test)]
    pub(crate) async fn search(&self, vector: &[f32], top_k: usize, scope: Option<&str>) -> Vec<ClauseChunk> {
        self.try_search(vector, top_k, scope).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Dense retrieval unavailable, returning no dense results");
            Vec::new()
        })
    }

    /// Nearest clauses for `vector`, best first; errs only when no backend could answer.
    pub async fn try_search(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let mut collected: Vec<ClauseChunk> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut answered = false;

        for backend in &self.backends {
            if answered && collected.len() >= top_k {
                break;
            }

            match tokio::time::timeout(self.timeout, backend.nearest(vector, top_k, scope)).await {
                Ok(Ok(chunks)) => {
                    answered = true;
                    tracing::debug!(backend = backend.name(), hits = chunks.len(), "Dense backend answered");
                    for chunk in chunks {
                        if !collected.iter().any(|c| c.id == chunk.id) {
                            collected.push(chunk);
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = backend.name(), error = %e, "Dense backend failed, falling back");
                    failures.push(format!("{}: {}", backend.name(), e));
                }
                Err(_) => {
                    tracing::warn!(
                        backend = backend.name(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Dense backend timed out, falling back"
                    );
                    failures.push(format!("{}: timed out", backend.name()));
                }
            }
        }

        if !answered && !failures.is_empty() {
            return Err(RegmatchError::Storage(format!(
                "no dense backend available ({})",
                failures.join("; ")
            )));
        }

        collected.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        collected.truncate(top_k);
        Ok(collected)
    }
}
