/// Key-value cache abstraction and an in-process implementation
///
/// Every cache user receives an `Arc<dyn CacheStore>` at construction, so tests and
/// deployments can swap the backing service. Values are JSON strings; a failing
/// cache is always treated as a miss by callers.

pub mod single_flight;

use async_trait::async_trait;
use moka::{sync::Cache, Expiry};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use single_flight::SingleFlight;

/// Errors raised by a cache backend.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Backend unreachable or internally broken
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// Stored value could not be encoded/decoded
    #[error("Cache codec error: {0}")]
    Codec(String),
}

/// Core trait for the key-value cache service.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live value, or None on miss/expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Add `by` to an integer counter, creating it with `ttl` if absent.
    /// Returns the new value.
    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CacheError>;
}

/// Build a deterministic cache key: `prefix:sha256(part_1 \u{1f} part_2 ...)`.
///
/// The unit separator keeps ("ab", "c") and ("a", "bc") apart.
pub fn cache_key(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}:{}", prefix, hex)
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
    /// Counter updates keep the deadline set when the counter was created.
    keep_deadline: bool,
}

/// Per-entry expiry: each entry lives for its own TTL.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if entry.keep_deadline {
            duration_until_expiry.or(Some(entry.ttl))
        } else {
            Some(entry.ttl)
        }
    }
}

/// In-process cache backed by moka with a per-entry TTL.
pub struct InMemoryCache {
    entries: Cache<String, Entry>,
    // Serializes read-modify-write in incr(); get/set never take it.
    counter_lock: Mutex<()>,
}

impl InMemoryCache {
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryTtl)
            .build();
        InMemoryCache {
            entries,
            counter_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                ttl,
                keep_deadline: false,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CacheError> {
        let _guard = self
            .counter_lock
            .lock()
            .map_err(|_| CacheError::Unavailable("counter lock poisoned".to_string()))?;

        let current = match self.entries.get(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|e| CacheError::Codec(format!("{} is not a counter: {}", key, e)))?,
            None => 0,
        };

        let next = current.saturating_add(by);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                ttl,
                keep_deadline: true,
            },
        );
        Ok(next)
    }
}
