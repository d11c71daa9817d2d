//! Worker pool supervisor: spawns tasks that lease jobs from a `JobQueue`
//! and drive them through a registered `JobHandler`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::WorkerId;
use super::queue::JobQueue;
use super::{JobContext, JobHandler, JobMiddleware};

/// Lifecycle state of a single worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_cancel_poll_interval_ms() -> u64 {
    100
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_lease_reclaim_interval_ms() -> u64 {
    1000
}

/// Configuration for a topic's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Delay between empty-queue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often a worker checks whether its in-flight job's
    /// cancellation was requested.
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,

    /// How often the pool sweeps for expired leases.
    #[serde(default = "default_lease_reclaim_interval_ms")]
    pub lease_reclaim_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            lease_reclaim_interval_ms: default_lease_reclaim_interval_ms(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn development() -> Self {
        Self {
            min_workers: 1,
            max_workers: 2,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            min_workers: 2,
            max_workers: 16,
            ..Default::default()
        }
    }
}

/// Rolling counters for a single worker. Duration tracking uses an
/// exponential moving average in integer milliseconds (alpha = 0.2)
/// rather than a full histogram, cheap enough to update on every job.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    avg_duration_ms: AtomicU64,
}

impl WorkerStats {
    fn record(&self, duration: Duration, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let sample = duration.as_millis() as u64;
        let old = self.avg_duration_ms.load(Ordering::Relaxed);
        let updated = if old == 0 {
            sample
        } else {
            old + (sample as i64 - old as i64) / 5
        } as u64;
        self.avg_duration_ms.store(updated, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn avg_duration_ms(&self) -> u64 {
        self.avg_duration_ms.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let processed = self.processed();
        if processed == 0 {
            return 1.0;
        }
        self.succeeded() as f64 / processed as f64
    }

    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    pub fn format(&self) -> String {
        format!(
            "processed={} succeeded={} failed={} success_rate={:.1}% avg_duration={}ms",
            self.processed(),
            self.succeeded(),
            self.failed(),
            self.success_rate() * 100.0,
            self.avg_duration_ms()
        )
    }
}

/// A single job-processing task bound to one topic.
pub struct Worker {
    pub id: WorkerId,
    topic: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    middleware: Vec<Arc<dyn JobMiddleware>>,
    state: RwLock<WorkerState>,
    stats: WorkerStats,
    poll_interval: Duration,
    cancel_poll_interval: Duration,
}

impl Worker {
    pub fn new(
        topic: impl Into<String>,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        middleware: Vec<Arc<dyn JobMiddleware>>,
        config: &WorkerPoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::new_v4(),
            topic: topic.into(),
            queue,
            handler,
            middleware,
            state: RwLock::new(WorkerState::Starting),
            stats: WorkerStats::default(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            cancel_poll_interval: Duration::from_millis(config.cancel_poll_interval_ms),
        })
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub async fn request_stop(&self) {
        *self.state.write().await = WorkerState::Stopping;
    }

    pub async fn pause(&self) {
        *self.state.write().await = WorkerState::Paused;
    }

    pub async fn resume(&self) {
        *self.state.write().await = WorkerState::Running;
    }

    /// Spawn the poll/process loop. Runs until `request_stop` is called.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            *self.state.write().await = WorkerState::Running;
            info!(worker_id = %self.id, topic = %self.topic, "worker started");

            loop {
                match self.state().await {
                    WorkerState::Stopping => break,
                    WorkerState::Paused => {
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                    _ => {}
                }

                match self.queue.dequeue(&self.topic, self.id).await {
                    Some(job) => self.process(job).await,
                    None => tokio::time::sleep(self.poll_interval).await,
                }
            }

            *self.state.write().await = WorkerState::Stopped;
            info!(worker_id = %self.id, topic = %self.topic, "worker stopped");
        })
    }

    async fn process(self: &Arc<Self>, job: super::job::Job) {
        let job_id = job.id;
        let ctx = JobContext::new(
            job_id,
            &self.topic,
            job.attempts,
            job.max_attempts,
            job.timeout,
            Arc::clone(&self.queue),
        );
        let cancel_flag = ctx.cancellation_handle();

        let watcher = {
            let queue = Arc::clone(&self.queue);
            let poll = self.cancel_poll_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(poll).await;
                    match queue.get(job_id).await {
                        Some(j) if j.cancel_requested => {
                            cancel_flag.store(true, Ordering::Relaxed);
                            break;
                        }
                        Some(j) if j.state.is_terminal() => break,
                        None => break,
                        _ => {}
                    }
                }
            })
        };

        for mw in &self.middleware {
            mw.before(&ctx).await;
        }

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(job.timeout, self.handler.handle(ctx.clone(), job.payload.clone())).await;
        let elapsed = started.elapsed();
        watcher.abort();

        match outcome {
            Ok(result) => {
                for mw in &self.middleware {
                    mw.after(&ctx, &result).await;
                }

                self.stats.record(elapsed, result.success);
                if result.success {
                    debug!(job_id = %job_id, worker_id = %self.id, "job succeeded");
                    if let Err(e) = self.queue.complete(job_id, result.data).await {
                        error!(job_id = %job_id, error = %e, "failed to mark job complete");
                    }
                } else {
                    let error = result.error.unwrap_or_else(|| "handler reported failure".to_string());
                    warn!(job_id = %job_id, worker_id = %self.id, %error, "job attempt failed");
                    if let Err(e) = self.queue.fail(job_id, error, result.retryable).await {
                        error!(job_id = %job_id, error = %e, "failed to record job failure");
                    }
                }
            }
            Err(_) => {
                self.stats.record(elapsed, false);
                warn!(job_id = %job_id, worker_id = %self.id, timeout_ms = job.timeout.as_millis(), "job attempt timed out");
                if let Err(e) = self
                    .queue
                    .fail(job_id, format!("timed out after {}ms", job.timeout.as_millis()), true)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to record job timeout");
                }
            }
        }
    }
}

/// Owns and scales a set of `Worker` tasks for one topic.
pub struct WorkerPool {
    topic: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    middleware: Vec<Arc<dyn JobMiddleware>>,
    config: WorkerPoolConfig,
    workers: RwLock<Vec<(Arc<Worker>, JoinHandle<()>)>>,
    reclaimer: RwLock<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        topic: impl Into<String>,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        middleware: Vec<Arc<dyn JobMiddleware>>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            queue,
            handler,
            middleware,
            config,
            workers: RwLock::new(Vec::new()),
            reclaimer: RwLock::new(None),
        }
    }

    /// Start with `min_workers` tasks and begin the lease-reclaim sweep.
    pub async fn start(&self) {
        self.scale_to(self.config.min_workers).await;

        let queue = Arc::clone(&self.queue);
        let interval = Duration::from_millis(self.config.lease_reclaim_interval_ms);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reclaimed = queue.reclaim_expired_leases().await;
                if !reclaimed.is_empty() {
                    debug!(count = reclaimed.len(), "reclaimed expired leases");
                }
            }
        });
        *self.reclaimer.write().await = Some(handle);
    }

    /// Adjust worker count to `target`, clamped to `[min_workers,
    /// max_workers]`. Scaling down requests a graceful stop on the
    /// newest workers; in-flight jobs finish their current attempt.
    pub async fn scale_to(&self, target: usize) {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        let mut workers = self.workers.write().await;

        while workers.len() < target {
            let worker = Worker::new(
                self.topic.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.handler),
                self.middleware.clone(),
                &self.config,
            );
            let handle = Arc::clone(&worker).spawn();
            workers.push((worker, handle));
        }

        while workers.len() > target {
            if let Some((worker, _handle)) = workers.pop() {
                worker.request_stop().await;
            }
        }

        info!(topic = %self.topic, workers = workers.len(), "worker pool scaled");
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Aggregate processed/succeeded/failed counts across all workers.
    pub async fn aggregate_stats(&self) -> (u64, u64, u64) {
        let workers = self.workers.read().await;
        workers.iter().fold((0, 0, 0), |(p, s, f), (w, _)| {
            (p + w.stats().processed(), s + w.stats().succeeded(), f + w.stats().failed())
        })
    }

    /// Stop every worker and the lease-reclaim sweep.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.write().await;
        for (worker, _handle) in workers.iter() {
            worker.request_stop().await;
        }
        for (_worker, handle) in workers.drain(..) {
            let _ = handle.await;
        }

        if let Some(handle) = self.reclaimer.write().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobResult};
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, _ctx: JobContext, payload: Vec<u8>) -> JobResult {
            JobResult::success(Some(payload))
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl JobHandler for AlwaysFailHandler {
        async fn handle(&self, _ctx: JobContext, _payload: Vec<u8>) -> JobResult {
            JobResult::failure("nope", false)
        }
    }

    #[tokio::test]
    async fn test_worker_processes_job_to_completion() {
        let queue = Arc::new(JobQueue::default());
        let pool = WorkerPool::new(
            "echo",
            Arc::clone(&queue),
            Arc::new(EchoHandler),
            vec![],
            WorkerPoolConfig::development(),
        );
        pool.start().await;

        let job = Job::new("echo", b"hi".to_vec());
        let id = job.id;
        queue.submit(job).await;

        for _ in 0..50 {
            if let Some(stored) = queue.get(id).await {
                if stored.state == super::super::job::JobState::Completed {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, super::super::job::JobState::Completed);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_pool_scales_within_bounds() {
        let queue = Arc::new(JobQueue::default());
        let pool = WorkerPool::new(
            "scale",
            Arc::clone(&queue),
            Arc::new(EchoHandler),
            vec![],
            WorkerPoolConfig {
                min_workers: 1,
                max_workers: 3,
                ..Default::default()
            },
        );
        pool.start().await;
        pool.scale_to(10).await;
        assert_eq!(pool.worker_count().await, 3);

        pool.scale_to(0).await;
        assert_eq!(pool.worker_count().await, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_retryable_failure_reaches_dead_letter() {
        let queue = Arc::new(JobQueue::default());
        let pool = WorkerPool::new(
            "fail",
            Arc::clone(&queue),
            Arc::new(AlwaysFailHandler),
            vec![],
            WorkerPoolConfig::development(),
        );
        pool.start().await;

        let job = Job::new("fail", vec![]);
        let id = job.id;
        queue.submit(job).await;

        for _ in 0..50 {
            if !queue.dead_letters().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(queue.dead_letters().await.iter().any(|d| d.job.id == id));
        pool.shutdown().await;
    }
}
