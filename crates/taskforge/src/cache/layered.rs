//! Layered get/set/delete over a memory tier and an external backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CacheError, ExternalBackend, MemoryTier};

/// Hit/miss counters split by tier, formatted for operator-facing
/// summaries.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    external_hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn external_hits(&self) -> u64 {
        self.external_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits() + self.external_hits();
        let total = hits + self.misses();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn format(&self) -> String {
        format!(
            "memory_hits={} external_hits={} misses={} hit_rate={:.1}%",
            self.memory_hits(),
            self.external_hits(),
            self.misses(),
            self.hit_rate() * 100.0
        )
    }
}

/// Two-tier cache: an in-process LRU fronting an external KV backend.
/// A miss in memory that hits the external tier is opportunistically
/// promoted back into memory so the next read is local.
pub struct LayeredCache {
    memory: MemoryTier,
    external: Arc<dyn ExternalBackend>,
    stats: CacheStats,
    promote_ttl: Duration,
}

impl LayeredCache {
    pub fn new(
        memory_capacity: usize,
        memory_max_bytes: usize,
        external: Arc<dyn ExternalBackend>,
        promote_ttl: Duration,
    ) -> Self {
        Self {
            memory: MemoryTier::new(memory_capacity, memory_max_bytes),
            external,
            stats: CacheStats::default(),
            promote_ttl,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(value) = self.memory.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        match self.external.get(key).await? {
            Some(value) => {
                self.stats.external_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "promoting external hit to memory tier");
                self.memory.set(key, value.clone(), Some(self.promote_ttl));
                Ok(Some(value))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.external.set(key, value.clone(), ttl).await?;
        self.memory.set(key, value, ttl.map(|t| t.min(self.promote_ttl)).or(Some(self.promote_ttl)));
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.memory.delete(key);
        self.external.delete(key).await
    }

    /// Delete every key matching a glob-style pattern from both tiers.
    /// Best-effort: see `ExternalBackend::keys_matching`.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let keys = self.external.keys_matching(pattern).await?;
        let mut deleted = 0;
        for key in &keys {
            self.memory.delete(key);
            if self.external.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Atomically increment a counter in the external tier, invalidating
    /// any stale cached copy in memory.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let value = self.external.incr(key, delta).await?;
        self.memory.delete(key);
        Ok(value)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.external.expire(key, ttl).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.external.ttl(key).await
    }
}
