/// Caching, coalescing decorator around any embedding provider.
///
/// Lookup order: cache hit → join an identical in-flight request → one upstream
/// call under a timeout, whose result is written back with a TTL and fanned out
/// to every waiter. Cache failures degrade to a miss.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{EmbeddingError, EmbeddingProvider};
use crate::cache::{cache_key, CacheStore, SingleFlight};

type SharedEmbedding = Result<Arc<Vec<f32>>, EmbeddingError>;

pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn CacheStore>,
    flights: SingleFlight<SharedEmbedding>,
    ttl: Duration,
    timeout: Duration,
}

impl CachedEmbedder {
    /// Wrap `provider`.
    ///
    /// - `ttl`: how long computed vectors stay cached (about an hour in production)
    /// - `timeout`: budget for a single upstream call
    /// - `lease`: how long a coalesced request may be joined before it is replaced
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn CacheStore>,
        ttl: Duration,
        timeout: Duration,
        lease: Duration,
    ) -> Self {
        CachedEmbedder {
            provider,
            cache,
            flights: SingleFlight::new(lease),
            ttl,
            timeout,
        }
    }

    fn key(&self, text: &str) -> String {
        cache_key("emb", &[self.provider.model_name(), text])
    }

    async fn cached(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<f32>>(&raw) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cached embedding");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Embedding cache unavailable, treating as miss");
                None
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = self.key(text);
        if let Some(vector) = self.cached(&key).await {
            return Ok(vector);
        }

        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let (ttl, timeout) = (self.ttl, self.timeout);
        let text = text.to_string();
        let write_key = key.clone();

        let shared = self
            .flights
            .run(&key, move || async move {
                let vector = match tokio::time::timeout(timeout, provider.embed(&text)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(EmbeddingError::Timeout(timeout.as_millis() as u64)),
                };

                match serde_json::to_string(&vector) {
                    Ok(raw) => {
                        if let Err(e) = cache.set(&write_key, raw, ttl).await {
                            tracing::debug!(error = %e, "Failed to cache embedding");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode embedding for cache"),
                }
                Ok(Arc::new(vector))
            })
            .await;

        shared.map(|vector| vector.as_ref().clone())
    }

    fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }
}
