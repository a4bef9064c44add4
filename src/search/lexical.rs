/// Lexical retrieval: conjunctive full-text search on key terms, with a
/// disjunctive substring fallback.
///
/// The fallback runs when no key terms survive extraction, or when full-text
/// search finds nothing or fails. Degenerate input yields an empty list.

use std::sync::Arc;
use std::time::Duration;

use super::terms::{extract_key_terms, fallback_words, MAX_FALLBACK_WORDS, MAX_KEY_TERMS};
use crate::errors::RegmatchError;
use crate::store::{ClauseChunk, TextSearchBackend};

pub struct LexicalRetriever {
    backend: Arc<dyn TextSearchBackend>,
    timeout: Duration,
}

impl LexicalRetriever {
    pub fn new(backend: Arc<dyn TextSearchBackend>, timeout: Duration) -> Self {
        LexicalRetriever { backend, timeout }
    }

    /// `try_search` with failures logged and treated as no results.
    #[cfg(test)]
    pub(crate) async fn search(&self, text: &str, top_k: usize, scope: Option<&str>) -> Vec<ClauseChunk> {
        self.try_search(text, top_k, scope).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Lexical retrieval unavailable, returning no lexical results");
            Vec::new()
        })
    }

    /// Keyword matches for `text`; errs only when the backend could not be reached at all.
    pub async fn try_search(
        &self,
        text: &str,
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let terms = extract_key_terms(text, MAX_KEY_TERMS);
        let mut full_text_error = None;

        if !terms.is_empty() {
            match tokio::time::timeout(self.timeout, self.backend.full_text(&terms, top_k, scope)).await {
                Ok(Ok(chunks)) if !chunks.is_empty() => return Ok(chunks),
                Ok(Ok(_)) => {
                    tracing::debug!(terms = ?terms, "No full-text matches, trying substring fallback");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Full-text search failed, trying substring fallback");
                    full_text_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Full-text search timed out, trying substring fallback"
                    );
                    full_text_error = Some(RegmatchError::Storage("full-text search timed out".into()));
                }
            }
        }

        let words = fallback_words(text, MAX_FALLBACK_WORDS);
        if words.is_empty() {
            return match full_text_error {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            };
        }

        match tokio::time::timeout(self.timeout, self.backend.substring(&words, top_k, scope)).await {
            Ok(result) => result,
            Err(_) => Err(RegmatchError::Storage("substring search timed out".into())),
        }
    }
}
