//! Bounded in-process cache: LRU recency, per-entry absolute expiry, and
//! prefix invalidation.
//!
//! Collections that change together share a key prefix (`messages:c:{id}:`,
//! `channels:s:{id}:`, …); a mutation purges the prefix before returning, so
//! readers see either pre- or post-mutation state, never a stale mix.
//!
//! One exclusive lock covers the map and the recency list — `get` promotes,
//! so even reads are writes here. Nothing suspends inside the critical
//! section.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 1024;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL'd LRU map from string keys to clonable values.
pub struct Cache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
}

impl<V: Clone> Cache<V> {
    /// Create a cache holding at most `capacity` entries. Zero coerces to
    /// the default of 1024.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).expect("non-zero"));
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Look up `key`. Expired entries are removed here, in the same call.
    /// A hit promotes the entry to most-recently-used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.peek(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|e| e.value.clone())
    }

    /// Insert or update `key`. Updating refreshes value, expiry, and
    /// recency; inserting at capacity evicts the least-recently-used entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().put(key.into(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The cache shared across services. Values are stored as JSON so one cache
/// can hold every collection type behind the shared prefixes.
pub type SharedCache = Cache<serde_json::Value>;

impl Cache<serde_json::Value> {
    /// Typed read; a value that no longer deserializes counts as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Typed write; values that fail to serialize are simply not cached.
    pub fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        if let Ok(v) = serde_json::to_value(value) {
            self.set(key, v, ttl);
        }
    }
}
