//! Public surface for submitting, tracking and cancelling jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::events::EventReceiver;
use super::job::{Job, JobId, JobQuery, SubmitOptions};
use super::queue::JobQueue;
use super::worker::WorkerPoolConfig;
use super::{JobError, JobHandler, JobMiddleware, WorkerPool};

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_retain_completed() -> usize {
    1000
}

fn default_retain_failed() -> usize {
    1000
}

/// Per-topic configuration registered independently of (and ahead of)
/// attaching a handler: retention for terminal jobs, and an optional
/// worker pool override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// How many completed jobs to keep visible via `get`/`list`.
    #[serde(default = "default_retain_completed")]
    pub retain_completed: usize,

    /// How many failed jobs to keep visible via `get`/`list`.
    #[serde(default = "default_retain_failed")]
    pub retain_failed: usize,

    /// Worker pool settings for this topic; falls back to the
    /// manager's default when absent.
    #[serde(default)]
    pub worker_pool: Option<WorkerPoolConfig>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            retain_completed: default_retain_completed(),
            retain_failed: default_retain_failed(),
            worker_pool: None,
        }
    }
}

/// Top-level configuration for a `JobManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManagerConfig {
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl JobManagerConfig {
    pub fn development() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::development(),
            dead_letter_capacity: 100,
        }
    }

    pub fn production() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::production(),
            dead_letter_capacity: 10_000,
        }
    }
}

/// Orchestrates a `JobQueue` with one `WorkerPool` per registered topic.
pub struct JobManager {
    queue: Arc<JobQueue>,
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
    topics: RwLock<HashMap<String, TopicConfig>>,
    config: JobManagerConfig,
}

impl JobManager {
    pub fn new(config: JobManagerConfig) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(config.dead_letter_capacity)),
            pools: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a topic's configuration (retention, worker pool
    /// override) ahead of attaching a handler. Idempotent: calling it
    /// again for the same topic replaces the stored configuration and
    /// retention is re-applied on the next terminal transition.
    pub async fn register_topic(&self, topic: impl Into<String>, config: TopicConfig) {
        let topic = topic.into();
        self.queue.set_retention(topic.clone(), config.retain_completed, config.retain_failed).await;
        self.topics.write().await.insert(topic, config);
    }

    /// Register a handler for `topic` and start its worker pool. At most
    /// one handler may be registered per topic; calling this twice
    /// returns `JobError::HandlerAlreadyRegistered` instead of replacing
    /// the existing handler.
    pub async fn register_handler(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        middleware: Vec<Arc<dyn JobMiddleware>>,
    ) -> Result<(), JobError> {
        let topic = topic.into();

        if self.pools.read().await.contains_key(&topic) {
            return Err(JobError::HandlerAlreadyRegistered(topic));
        }

        let topic_config = self.topics.read().await.get(&topic).cloned();
        let worker_pool_config = topic_config
            .as_ref()
            .and_then(|c| c.worker_pool.clone())
            .unwrap_or_else(|| self.config.worker_pool.clone());
        if topic_config.is_none() {
            self.topics.write().await.insert(topic.clone(), TopicConfig::default());
        }

        let pool = Arc::new(WorkerPool::new(
            topic.clone(),
            Arc::clone(&self.queue),
            handler,
            middleware,
            worker_pool_config,
        ));
        pool.start().await;

        info!(topic = %topic, "handler registered");
        self.pools.write().await.insert(topic, pool);
        Ok(())
    }

    /// Submit a job to `topic`. Fails with `JobError::UnknownTopic` if
    /// the topic has never been registered, or `JobError::NotInitialized`
    /// if it was registered via `register_topic` but has no handler
    /// attached yet.
    pub async fn submit(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<JobId, JobError> {
        let topic = topic.into();
        if !self.pools.read().await.contains_key(&topic) {
            if !self.topics.read().await.contains_key(&topic) {
                return Err(JobError::UnknownTopic(topic));
            }
            return Err(JobError::NotInitialized);
        }

        let mut job = Job::new(topic, payload);
        if let Some(memory_requirement) = opts.memory_requirement {
            job = job.with_memory_requirement(memory_requirement);
        }
        if let Some(priority) = opts.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = opts.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(timeout_ms) = opts.timeout_ms {
            job = job.with_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(delay_ms) = opts.delay_ms {
            let at = chrono::Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            job = job.with_delay_until(at);
        }
        if !opts.tags.is_empty() {
            job = job.with_tags(opts.tags);
        }

        Ok(self.queue.submit(job).await)
    }

    pub async fn status(&self, job_id: JobId) -> Option<Job> {
        self.queue.get(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<(), JobError> {
        self.queue.cancel(job_id).await
    }

    pub async fn list(&self, query: JobQuery) -> Vec<Job> {
        self.queue.list(&query).await
    }

    pub async fn set_retry_policy(&self, topic: impl Into<String>, policy: super::retry::RetryPolicy) {
        self.queue.set_retry_policy(topic, policy).await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.queue.subscribe()
    }

    /// Scale a topic's worker pool to `target`, clamped to its configured
    /// bounds.
    pub async fn scale_topic(&self, topic: &str, target: usize) -> Result<(), JobError> {
        let pools = self.pools.read().await;
        let pool = pools.get(topic).ok_or_else(|| JobError::NoHandler(topic.to_string()))?;
        pool.scale_to(target).await;
        Ok(())
    }

    /// Aggregate (processed, succeeded, failed) counts across a topic's
    /// worker pool, if registered.
    pub async fn pool_stats(&self, topic: &str) -> Option<(u64, u64, u64)> {
        let pools = self.pools.read().await;
        let pool = pools.get(topic)?;
        Some(pool.aggregate_stats().await)
    }

    /// Number of active workers for a topic, if registered.
    pub async fn worker_count(&self, topic: &str) -> Option<usize> {
        let pools = self.pools.read().await;
        let pool = pools.get(topic)?;
        Some(pool.worker_count().await)
    }

    /// Every topic with a registered handler.
    pub async fn topics(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    pub async fn waiting_count(&self, topic: &str) -> usize {
        self.queue.waiting_count(topic).await
    }

    pub async fn active_count(&self) -> usize {
        self.queue.active_count().await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.queue.dead_letters().await.len()
    }

    pub async fn shutdown(&self) {
        let mut pools = self.pools.write().await;
        for (_topic, pool) in pools.drain() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobResult;
    use crate::jobs::JobContext;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _ctx: JobContext, _payload: Vec<u8>) -> JobResult {
            JobResult::success(None)
        }
    }

    #[tokio::test]
    async fn test_submit_without_handler_is_rejected() {
        let manager = JobManager::new(JobManagerConfig::development());
        let result = manager.submit("unregistered", vec![], SubmitOptions::default()).await;
        assert!(matches!(result, Err(JobError::UnknownTopic(_))));
    }

    #[tokio::test]
    async fn test_submit_after_register_topic_without_handler_is_not_initialized() {
        let manager = JobManager::new(JobManagerConfig::development());
        manager.register_topic("work", TopicConfig::default()).await;
        let result = manager.submit("work", vec![], SubmitOptions::default()).await;
        assert!(matches!(result, Err(JobError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_submit_and_status_round_trip() {
        let manager = JobManager::new(JobManagerConfig::development());
        manager.register_handler("work", Arc::new(NoopHandler), vec![]).await.unwrap();

        let id = manager.submit("work", b"data".to_vec(), SubmitOptions::default()).await.unwrap();
        let job = manager.status(id).await.unwrap();
        assert_eq!(job.topic, "work");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_handler_twice_is_rejected() {
        let manager = JobManager::new(JobManagerConfig::development());
        manager.register_handler("work", Arc::new(NoopHandler), vec![]).await.unwrap();
        let result = manager.register_handler("work", Arc::new(NoopHandler), vec![]).await;
        assert!(matches!(result, Err(JobError::HandlerAlreadyRegistered(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let manager = JobManager::new(JobManagerConfig::development());
        let result = manager.cancel(JobId::new_v4()).await;
        assert!(matches!(result, Err(JobError::NotFound(_))));
    }
}
