//! Job types and definitions

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
pub type JobId = Uuid;

/// Unique worker identifier.
pub type WorkerId = Uuid;

/// Dispatch priority. Higher values execute first; ties break FIFO by
/// `created_at`. An arbitrary integer rather than a fixed tier set, so
/// callers can express fine-grained ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Default for Priority {
    fn default() -> Self {
        Priority(0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Priority {
    fn from(v: i32) -> Self {
        Priority(v)
    }
}

/// Job execution state. Transitions form a DAG: `waiting -> [delayed ->
/// waiting]* -> active -> {completed | failed | cancelled}`, plus
/// `active -> waiting` on lease expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Eligible for dispatch now.
    Waiting,

    /// Invisible until `delay_until`.
    Delayed,

    /// Leased to a worker.
    Active,

    /// Terminal: succeeded.
    Completed,

    /// Terminal: exhausted retries.
    Failed,

    /// Terminal: cancelled before or during execution.
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Waiting
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl JobState {
    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the job still occupies space in the active set.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }
}

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Whether the attempt succeeded.
    pub success: bool,

    /// Opaque result payload, if any.
    pub data: Option<Vec<u8>>,

    /// Error message, if failed.
    pub error: Option<String>,

    /// Whether a handler-reported failure is retryable. Ignored when
    /// `success` is true.
    pub retryable: bool,
}

impl JobResult {
    /// Build a success result.
    pub fn success(data: Option<Vec<u8>>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            retryable: true,
        }
    }

    /// Build a failure result.
    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            retryable,
        }
    }
}

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Server-assigned unique identifier.
    pub id: JobId,

    /// Name of the topic (queue) this job belongs to.
    pub topic: String,

    /// Opaque payload bytes; the core never interprets these.
    pub payload: Vec<u8>,

    /// Dispatch priority.
    pub priority: Priority,

    /// Current state.
    pub state: JobState,

    /// Attempts made so far (monotone, increments on each lease).
    pub attempts: u32,

    /// Maximum attempts before terminating as `Failed`.
    pub max_attempts: u32,

    /// Per-attempt execution deadline.
    pub timeout: Duration,

    /// Job is invisible for dispatch before this instant.
    pub delay_until: Option<DateTime<Utc>>,

    /// Progress percent, 0..=100, monotone non-decreasing.
    pub progress: Option<u8>,

    /// Bytes the resource manager should reserve against its memory
    /// budget while this job is in flight. Zero means unmetered.
    pub memory_requirement: u64,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent lease.
    pub started_at: Option<DateTime<Utc>>,

    /// Timestamp a terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Opaque result payload once completed.
    pub result: Option<Vec<u8>>,

    /// Worker currently holding the lease, if active.
    pub worker_id: Option<WorkerId>,

    /// Cooperative cancellation flag, observable by a running handler's
    /// context. Set by `JobManager::cancel` on an active job.
    pub cancel_requested: bool,

    /// Free-form tags for querying.
    pub tags: Vec<String>,

    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

impl Job {
    /// Create a new job in the `Waiting` state.
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new_v4(),
            topic: topic.into(),
            payload,
            priority: Priority::default(),
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: 3,
            timeout: Duration::from_secs(300),
            delay_until: None,
            progress: None,
            memory_requirement: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
            worker_id: None,
            cancel_requested: false,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Builder: set max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Builder: set per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: delay until the given instant; job starts `Delayed`.
    pub fn with_delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self.state = JobState::Delayed;
        self
    }

    /// Builder: attach tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Builder: declare the memory this job reserves against a
    /// `ResourceManager`'s budget while it runs.
    pub fn with_memory_requirement(mut self, bytes: u64) -> Self {
        self.memory_requirement = bytes;
        self
    }

    /// Whether the job's delay has elapsed (or it has none).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.delay_until {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Whether another attempt is permitted.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Dispatch ordering key: `(priority desc, delay_until asc, created_at asc)`.
    /// Callers compare this tuple directly; see `jobs::queue` for the
    /// `Ord` wrapper used in the waiting index.
    pub fn dispatch_key(&self) -> (i32, DateTime<Utc>, DateTime<Utc>) {
        (
            -self.priority.0,
            self.delay_until.unwrap_or(self.created_at),
            self.created_at,
        )
    }
}

/// Options accepted by `JobManager::submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Dispatch priority.
    pub priority: Option<Priority>,

    /// Delay before the job becomes eligible, in milliseconds.
    pub delay_ms: Option<u64>,

    /// Max retry attempts.
    pub max_attempts: Option<u32>,

    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Tags for querying.
    pub tags: Vec<String>,

    /// Bytes to reserve against a `ResourceManager`'s memory budget.
    pub memory_requirement: Option<u64>,
}

/// Filter used by `JobManager::list`.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Restrict to a topic.
    pub topic: Option<String>,

    /// Restrict to a state.
    pub state: Option<JobState>,

    /// All listed tags must be present.
    pub tags: Vec<String>,

    /// Maximum results.
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation_defaults() {
        let job = Job::new("conv", b"payload".to_vec());
        assert_eq!(job.topic, "conv");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn test_dispatch_key_orders_by_priority_desc() {
        let low = Job::new("t", vec![]).with_priority(1);
        let high = Job::new("t", vec![]).with_priority(10);
        assert!(high.dispatch_key() < low.dispatch_key());
    }

    #[test]
    fn test_delay_until_marks_delayed() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        let job = Job::new("t", vec![]).with_delay_until(future);
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn test_can_retry() {
        let mut job = Job::new("t", vec![]).with_max_attempts(2);
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }
}
