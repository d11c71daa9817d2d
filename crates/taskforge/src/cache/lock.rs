//! Distributed locks built on an `ExternalBackend`'s conditional set.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use super::{CacheError, ExternalBackend};

/// Acquires and releases locks keyed in the external backend. Each
/// acquisition gets a random token so a lock can only be released by
/// the holder that acquired it, not by whoever calls release next.
pub struct DistributedLock {
    backend: Arc<dyn ExternalBackend>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn ExternalBackend>) -> Self {
        Self { backend }
    }

    /// Attempt to acquire `key` for `ttl`, returning a guard that
    /// releases it on drop. Returns `None` if already held.
    pub async fn acquire(&self, key: impl Into<String>, ttl: Duration) -> Result<Option<LockGuard>, CacheError> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();
        let acquired = self.backend.try_acquire_lock(&key, &token, ttl).await?;
        if acquired {
            Ok(Some(LockGuard {
                backend: Arc::clone(&self.backend),
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Poll `acquire` until it succeeds or `timeout` elapses.
    pub async fn acquire_blocking(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<LockGuard>, CacheError> {
        let key = key.into();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(guard) = self.acquire(key.clone(), ttl).await? {
                return Ok(Some(guard));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// RAII handle on an acquired lock. Releasing is best-effort: dropping
/// a guard without calling `release` spawns a background release so
/// the lock does not outlive its intended scope, but callers that need
/// to observe failure should call `release` explicitly.
pub struct LockGuard {
    backend: Arc<dyn ExternalBackend>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock, returning whether this guard still held it.
    pub async fn release(mut self) -> Result<bool, CacheError> {
        self.released = true;
        self.backend.release_lock(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.release_lock(&key, &token).await {
                warn!(%key, error = %e, "failed to release lock on drop");
            }
        });
    }
}
