//! Size- and age-bounded caching with an injected clock.
//!
//! [`TtlCache`] evicts the least recently used entry once `capacity` is
//! reached and treats entries older than `ttl` as absent. Time comes from a
//! [`Clock`], so expiry can be tested without sleeping.

use crate::error::IndexError;
use crate::index::DocumentIndex;
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, (V, Instant)>,
    stats: CacheStats,
}

/// LRU cache whose entries also expire after a fixed age.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    /// A `capacity` of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            ttl,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let lookup = inner
            .entries
            .get(key)
            .map(|(value, inserted)| (value.clone(), now.duration_since(*inserted) < self.ttl));
        match lookup {
            Some((value, true)) => {
                inner.stats.hits += 1;
                Some(value)
            }
            Some((_, false)) => {
                inner.entries.pop(key);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.lock().entries.put(key, (value, now));
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    conversation_id: String,
    text: String,
    top_k: usize,
    threshold_bits: u32,
}

/// Decorator that caches successful `query` payloads. Collection stats
/// always go to the wrapped index so an emptied collection is seen at once.
pub struct CachingDocumentIndex {
    inner: Arc<dyn DocumentIndex>,
    cache: TtlCache<QueryKey, Value>,
}

impl CachingDocumentIndex {
    pub fn new(inner: Arc<dyn DocumentIndex>, capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(inner, capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        inner: Arc<dyn DocumentIndex>,
        capacity: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            cache: TtlCache::new(capacity, ttl, clock),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl DocumentIndex for CachingDocumentIndex {
    async fn get_collection_stats(&self, conversation_id: &str) -> Result<Value, IndexError> {
        self.inner.get_collection_stats(conversation_id).await
    }

    async fn query(
        &self,
        conversation_id: &str,
        text: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Value, IndexError> {
        let key = QueryKey {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            top_k,
            threshold_bits: similarity_threshold.to_bits(),
        };
        if let Some(hit) = self.cache.get(&key) {
            debug!(conversation_id, top_k, "Document query cache hit");
            return Ok(hit);
        }
        let payload = self
            .inner
            .query(conversation_id, text, top_k, similarity_threshold)
            .await?;
        self.cache.insert(key, payload.clone());
        Ok(payload)
    }
}
