/// Retrieval metrics: per-source result counters in time buckets.
///
/// Counters live in the shared cache under
/// `metrics:retrieval:<source>:<bucket>` and expire after a day. Recording is
/// fire-and-forget: it never blocks or fails the search that produced it.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheStore;
use crate::store::SourceTag;

/// One observation: `count` results came from `source` during `time_bucket`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalMetricSample {
    pub source: SourceTag,
    pub count: usize,
    /// Unix seconds divided by the bucket width
    pub time_bucket: i64,
}

impl RetrievalMetricSample {
    pub fn key(&self) -> String {
        format!("metrics:retrieval:{}:{}", self.source, self.time_bucket)
    }
}

#[derive(Clone)]
pub struct MetricsRecorder {
    cache: Arc<dyn CacheStore>,
    bucket_secs: i64,
    ttl: Duration,
}

impl MetricsRecorder {
    pub fn new(cache: Arc<dyn CacheStore>, bucket_secs: u64, ttl: Duration) -> Self {
        MetricsRecorder {
            cache,
            bucket_secs: bucket_secs.max(1) as i64,
            ttl,
        }
    }

    pub fn sample(&self, source: SourceTag, count: usize) -> RetrievalMetricSample {
        RetrievalMetricSample {
            source,
            count,
            time_bucket: Utc::now().timestamp().div_euclid(self.bucket_secs),
        }
    }

    /// Increment the counter for `source` in the background.
    ///
    /// Outside a tokio runtime this is a no-op.
    pub fn record(&self, source: SourceTag, count: usize) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sample = self.sample(source, count);
        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;

        handle.spawn(async move {
            let key = sample.key();
            if let Err(e) = cache.incr(&key, sample.count as i64, ttl).await {
                tracing::debug!(key = %key, error = %e, "Failed to record retrieval metric");
            }
        });
    }

    /// Current value of the counter for `source` in this bucket (0 if absent).
    pub async fn current(&self, source: SourceTag) -> i64 {
        let key = self.sample(source, 0).key();
        match self.cache.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
