//! Job processing: queue, worker pool, retry policy, dead-letter queue
//! and the handler/middleware traits domain code implements against.

pub mod dead_letter;
pub mod events;
pub mod job;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use events::{EventReceiver, EventSender, JobEvent};
pub use job::{Job, JobId, JobQuery, JobResult, JobState, Priority, SubmitOptions, WorkerId};
pub use manager::{JobManager, JobManagerConfig, TopicConfig};
pub use queue::JobQueue;
pub use retry::{ExponentialBackoff, RetryHistory, RetryPolicy};
pub use worker::{Worker, WorkerPool, WorkerPoolConfig, WorkerStats};

/// Errors raised by the job processing subsystem.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("handler execution failed: {0}")]
    Execution(String),

    #[error("job exceeded timeout of {0}ms")]
    TimeoutMillis(u64),

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("no handler registered for topic '{0}'")]
    NoHandler(String),

    #[error("handler already registered for topic '{0}'")]
    HandlerAlreadyRegistered(String),

    #[error("topic '{0}' is not registered")]
    UnknownTopic(String),

    #[error("topic registered but not yet initialized with a handler")]
    NotInitialized,
}

impl JobError {
    /// Category used by the crate-wide `Error::category()`: Validation /
    /// Admission / Handler / Timeout / Transport / Fatal.
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Serialization(_) | JobError::Deserialization(_) => "validation",
            JobError::Queue(_) => "transport",
            JobError::Worker(_) => "fatal",
            JobError::Execution(_) => "handler",
            JobError::TimeoutMillis(_) => "timeout",
            JobError::Cancelled(_) => "handler",
            JobError::NotFound(_) => "validation",
            JobError::NoHandler(_) => "validation",
            JobError::HandlerAlreadyRegistered(_) => "validation",
            JobError::UnknownTopic(_) => "validation",
            JobError::NotInitialized => "validation",
        }
    }
}

/// Context passed to a `JobHandler::handle` invocation, describing the
/// current attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub topic: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Instant,
    pub timeout: Duration,
    cancelled: Arc<AtomicBool>,
    queue: Arc<JobQueue>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("topic", &self.topic)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        topic: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        timeout: Duration,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            job_id,
            topic: topic.into(),
            attempt,
            max_attempts,
            started_at: Instant::now(),
            timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
            queue,
        }
    }

    /// Handle used by the worker to request cooperative cancellation;
    /// the context returned to the handler observes the same flag.
    pub(crate) fn cancellation_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn has_timed_out(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Whether `JobManager::cancel` has been called for this job since
    /// the attempt started. Handlers doing long-running or chunked work
    /// should poll this and return early when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Report progress as a percent, 0..=100. Clamped and monotone
    /// non-decreasing; best-effort if the job has already finished.
    pub async fn report_progress(&self, percent: u8) {
        let _ = self.queue.update_progress(self.job_id, percent).await;
    }
}

/// Domain code implements this to process jobs submitted to a topic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt. Returning `Err` with `retryable: true` on
    /// the inner `JobResult::failure` re-queues the job (subject to
    /// `max_attempts`); `retryable: false` sends it straight to the
    /// dead-letter queue.
    async fn handle(&self, ctx: JobContext, payload: Vec<u8>) -> JobResult;
}

/// Hook invoked around job execution, for cross-cutting concerns
/// (metrics, tracing spans, auditing) that should not live in handlers.
#[async_trait]
pub trait JobMiddleware: Send + Sync {
    async fn before(&self, ctx: &JobContext) {
        let _ = ctx;
    }

    async fn after(&self, ctx: &JobContext, result: &JobResult) {
        let _ = (ctx, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_categories() {
        assert_eq!(JobError::TimeoutMillis(1000).category(), "timeout");
        assert_eq!(JobError::Cancelled(JobId::new_v4()).category(), "handler");
        assert_eq!(JobError::NotFound(JobId::new_v4()).category(), "validation");
    }

    #[test]
    fn test_job_context_cancellation_is_observable() {
        let ctx = JobContext::new(JobId::new_v4(), "t", 1, 3, Duration::from_secs(1), Arc::new(JobQueue::default()));
        let handle = ctx.cancellation_handle();
        assert!(!ctx.is_cancelled());
        handle.store(true, Ordering::Relaxed);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_job_context_last_attempt() {
        let ctx = JobContext::new(JobId::new_v4(), "t", 3, 3, Duration::from_secs(1), Arc::new(JobQueue::default()));
        assert!(ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_job_context_report_progress_updates_job() {
        let queue = Arc::new(JobQueue::default());
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;

        let ctx = JobContext::new(id, "t", 1, 3, Duration::from_secs(1), Arc::clone(&queue));
        ctx.report_progress(55).await;

        assert_eq!(queue.get(id).await.unwrap().progress, Some(55));
    }
}
