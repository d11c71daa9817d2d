//! Layered cache: an in-process LRU tier fronting an external key-value
//! backend, with opportunistic promotion, pattern delete, distributed
//! locks and atomic counters.

pub mod external;
pub mod layered;
pub mod lock;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use external::{RedisBackend, RedisConfig};
pub use layered::{CacheStats, LayeredCache};
pub use lock::{DistributedLock, LockGuard};
pub use memory::MemoryTier;

/// Errors raised by the cache subsystem.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("pool exhausted")]
    PoolExhausted,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("lock contention on key: {0}")]
    LockContention(String),
}

/// Contract a distributed key-value store implements to back the deep
/// tier of a `LayeredCache`. Implemented by `RedisBackend`; tests use an
/// in-memory fake implementing the same trait.
#[async_trait]
pub trait ExternalBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically add `delta` to the integer stored at `key`, creating
    /// it at `delta` if absent, and return the new value.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Keys matching a glob-style pattern (`prefix:*`), used for
    /// pattern delete. Backends that cannot scan efficiently may return
    /// a partial or empty result; callers should treat pattern delete as
    /// best-effort diagnostics, not a correctness primitive.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Conditionally set `key` to `token` only if absent, with an
    /// expiry, returning whether the lock was acquired.
    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Release a lock previously acquired with `token`; a no-op
    /// (returns `false`) if the lock is held by a different token.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError>;
}
