//! Job lifecycle event stream

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::job::{JobId, WorkerId};

/// Default capacity of the broadcast channel backing `JobManager::subscribe`.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A lifecycle transition emitted by the job manager. Subscribers receive
/// these via `broadcast::Receiver`; a slow subscriber that falls behind
/// the channel capacity observes `RecvError::Lagged` and should treat it
/// as "resync from `JobManager::status`", not a fatal error.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was accepted into a topic.
    Submitted {
        job_id: JobId,
        topic: String,
        at: DateTime<Utc>,
    },

    /// A worker leased the job and began execution.
    Started {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// A handler reported progress during execution.
    Progress {
        job_id: JobId,
        percent: u8,
        at: DateTime<Utc>,
    },

    /// A handler completed successfully.
    Completed { job_id: JobId, at: DateTime<Utc> },

    /// An attempt failed but the job was re-queued for retry.
    Retrying {
        job_id: JobId,
        attempt: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },

    /// The job exhausted its retries and moved to the dead-letter queue.
    Dead {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// The job was cancelled before or during execution.
    Cancelled { job_id: JobId, at: DateTime<Utc> },
}

impl JobEvent {
    /// The job this event concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Dead { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => *job_id,
        }
    }
}

/// Sending half held by the job manager; cloned into workers so any of
/// them can publish lifecycle events without routing back through a
/// central dispatcher.
pub type EventSender = broadcast::Sender<JobEvent>;

/// Receiving half handed out by `JobManager::subscribe`.
pub type EventReceiver = broadcast::Receiver<JobEvent>;

/// Construct a fresh broadcast channel for job events.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
