//! Redis-backed `ExternalBackend` implementation.
//!
//! A lazily established `ConnectionManager` behind a lock, re-dialed on
//! demand with exponential backoff rather than torn down and rebuilt by
//! a supervisor task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::CacheError;

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    100
}

/// Configuration for the Redis-backed deep tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        }
    }
}

/// `ExternalBackend` implementation over a Redis connection manager.
pub struct RedisBackend {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
    config: RedisConfig,
}

impl RedisBackend {
    pub fn new(config: RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url.clone())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
            config,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        {
            let guard = self.manager.read().await;
            if let Some(manager) = guard.as_ref() {
                return Ok(manager.clone());
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(
                Duration::from_millis(self.config.connect_timeout_ms),
                self.client.get_connection_manager(),
            )
            .await
            {
                Ok(Ok(manager)) => {
                    info!("redis connection established");
                    *self.manager.write().await = Some(manager.clone());
                    return Ok(manager);
                }
                Ok(Err(e)) if attempt < self.config.max_reconnect_attempts => {
                    warn!(attempt, error = %e, "redis connection failed, retrying");
                    let delay = self.config.reconnect_base_delay_ms * 2u64.pow(attempt.min(6));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Ok(Err(e)) => {
                    error!(attempt, error = %e, "redis connection exhausted retries");
                    return Err(CacheError::Connection(e.to_string()));
                }
                Err(_) => {
                    if attempt >= self.config.max_reconnect_attempts {
                        return Err(CacheError::Timeout(Duration::from_millis(self.config.connect_timeout_ms)));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl super::ExternalBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Operation(e.to_string())),
            None => conn.set(key, value).await.map_err(|e| CacheError::Operation(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| CacheError::Operation(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        conn.exists(key).await.map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        conn.incr(key, delta).await.map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.connection().await?;
        let secs: i64 = conn.ttl(key).await.map_err(|e| CacheError::Operation(e.to_string()))?;
        Ok(if secs > 0 { Some(Duration::from_secs(secs as u64)) } else { None })
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        // KEYS is O(n) over the keyspace; acceptable for diagnostics,
        // never called on the hot path.
        let mut conn = self.connection().await?;
        conn.keys(pattern).await.map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Operation(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let held: Option<String> = conn.get(key).await.map_err(|e| CacheError::Operation(e.to_string()))?;
        if held.as_deref() != Some(token) {
            return Ok(false);
        }
        let removed: i64 = conn.del(key).await.map_err(|e| CacheError::Operation(e.to_string()))?;
        Ok(removed > 0)
    }
}

/// In-memory fake satisfying `ExternalBackend`, used in tests so the
/// layered cache's promotion and pattern-delete behavior can be
/// exercised without a live Redis instance.
pub struct FakeBackend {
    store: Arc<parking_lot::Mutex<std::collections::HashMap<String, (Vec<u8>, Option<std::time::Instant>)>>>,
    locks: Arc<parking_lot::Mutex<std::collections::HashMap<String, String>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
            locks: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::ExternalBackend for FakeBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut store = self.store.lock();
        if let Some((_, Some(deadline))) = store.get(key) {
            if *deadline <= std::time::Instant::now() {
                store.remove(key);
                return Ok(None);
            }
        }
        Ok(store.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|d| std::time::Instant::now() + d);
        self.store.lock().insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.lock().contains_key(key))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut store = self.store.lock();
        let entry = store.entry(key.to_string()).or_insert((b"0".to_vec(), None));
        let current: i64 = String::from_utf8_lossy(&entry.0).parse().unwrap_or(0);
        let next = current + delta;
        entry.0 = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut store = self.store.lock();
        if let Some(entry) = store.get_mut(key) {
            entry.1 = Some(std::time::Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let store = self.store.lock();
        Ok(store.get(key).and_then(|(_, deadline)| {
            deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()))
        }))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let prefix = pattern.trim_end_matches('*');
        Ok(self.store.lock().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn try_acquire_lock(&self, key: &str, token: &str, _ttl: Duration) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock();
        if locks.contains_key(key) {
            Ok(false)
        } else {
            locks.insert(key.to_string(), token.to_string());
            Ok(true)
        }
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock();
        if locks.get(key).map(|t| t == token).unwrap_or(false) {
            locks.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
