//! In-process LRU tier with per-entry TTL and a byte-size budget.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
    size: usize,
}

struct Inner {
    cache: LruCache<String, Entry>,
    total_bytes: usize,
}

/// Fixed-capacity, TTL-aware LRU cache bounded by both entry count and a
/// total byte budget. This is the fast local tier a `LayeredCache` checks
/// before falling through to the external backend.
pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(capacity),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let expired = match inner.cache.peek(key) {
            Some(entry) => matches!(entry.expires_at, Some(at) if at <= Utc::now()),
            None => return None,
        };
        if expired {
            pop_entry(&mut inner, key);
            return None;
        }
        inner.cache.get(key).map(|e| e.value.clone())
    }

    /// Insert `value` under `key`. Returns `false` and leaves the tier
    /// unchanged if `value` alone exceeds `max_bytes` (no amount of
    /// eviction could make room for it); otherwise evicts LRU entries
    /// until the insert fits within the byte budget and returns `true`.
    pub fn set(&self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let size = value.len();
        if size > self.max_bytes {
            return false;
        }

        let key = key.into();
        let expires_at = ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| Utc::now() + d);

        let mut inner = self.inner.lock();
        pop_entry(&mut inner, &key);

        while inner.total_bytes + size > self.max_bytes {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.size,
                None => break,
            }
        }

        inner.total_bytes += size;
        if let Some((_, evicted)) = inner.cache.push(key, Entry { value, expires_at, size }) {
            inner.total_bytes -= evicted.size;
        }
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        pop_entry(&mut inner, key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cache.is_empty()
    }

    /// Total bytes currently held across all entries.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

fn pop_entry(inner: &mut Inner, key: &str) -> Option<Entry> {
    let removed = inner.cache.pop(key);
    if let Some(entry) = &removed {
        inner.total_bytes -= entry.size;
    }
    removed
}
