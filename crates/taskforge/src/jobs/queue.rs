//! In-process job queue.
//!
//! The queue's state machine lives entirely in-process behind a single
//! mutex, rather than being pushed into an external KV store. Ordering
//! and lease atomicity are therefore exact by construction instead of
//! depending on round-trips to a store.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::dead_letter::DeadLetterQueue;
use super::events::{self, EventSender, JobEvent};
use super::job::{Job, JobId, JobQuery, JobState, WorkerId};
use super::retry::{RetryHistory, RetryPolicy};
use super::JobError;

/// Ordering key used by the waiting index: `(priority desc, delay_until
/// asc, created_at asc, job_id)`. The trailing id breaks ties between
/// jobs created at the same instant with the same priority.
type WaitingKey = (i32, DateTime<Utc>, DateTime<Utc>, JobId);

fn waiting_key(job: &Job) -> WaitingKey {
    let (p, d, c) = job.dispatch_key();
    (p, d, c, job.id)
}

struct Lease {
    worker_id: WorkerId,
    expires_at: DateTime<Utc>,
}

struct Inner {
    jobs: HashMap<JobId, Job>,
    waiting: HashMap<String, BTreeSet<WaitingKey>>,
    leases: HashMap<JobId, Lease>,
    retry_history: HashMap<JobId, RetryHistory>,
    retry_policies: HashMap<String, RetryPolicy>,
    dead_letters: DeadLetterQueue,
    /// Per-topic `(retain_completed, retain_failed)` counts. A topic
    /// absent from this map retains every terminal job (unbounded).
    retention: HashMap<String, (usize, usize)>,
}

/// Drop the oldest same-topic, same-state terminal jobs beyond `retain`,
/// FIFO by `finished_at`. A no-op when `retain` is `usize::MAX`.
fn prune_terminal(inner: &mut Inner, topic: &str, state: JobState, retain: usize) {
    if retain == usize::MAX {
        return;
    }
    let mut matching: Vec<(JobId, DateTime<Utc>)> = inner
        .jobs
        .values()
        .filter(|j| j.topic == topic && j.state == state)
        .map(|j| (j.id, j.finished_at.unwrap_or(j.created_at)))
        .collect();
    if matching.len() <= retain {
        return;
    }
    matching.sort_by_key(|(_, finished_at)| *finished_at);
    let excess = matching.len() - retain;
    for (id, _) in matching.into_iter().take(excess) {
        inner.jobs.remove(&id);
    }
}

/// Per-topic, priority-ordered job queue with lease-based dispatch.
pub struct JobQueue {
    inner: Mutex<Inner>,
    events: EventSender,
    default_dead_letter_capacity: usize,
}

impl JobQueue {
    pub fn new(dead_letter_capacity: usize) -> Self {
        let (tx, _rx) = events::channel(events::DEFAULT_EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                waiting: HashMap::new(),
                leases: HashMap::new(),
                retry_history: HashMap::new(),
                retry_policies: HashMap::new(),
                dead_letters: DeadLetterQueue::new(dead_letter_capacity),
                retention: HashMap::new(),
            }),
            events: tx,
            default_dead_letter_capacity: dead_letter_capacity,
        }
    }

    /// Subscribe to lifecycle events for every topic.
    pub fn subscribe(&self) -> events::EventReceiver {
        self.events.subscribe()
    }

    /// Configure the retry policy used for a topic's jobs. Jobs submitted
    /// before this call use `RetryPolicy::default()`.
    pub async fn set_retry_policy(&self, topic: impl Into<String>, policy: RetryPolicy) {
        let mut inner = self.inner.lock().await;
        inner.retry_policies.insert(topic.into(), policy);
    }

    /// Configure how many terminal (completed/failed) jobs a topic keeps
    /// visible via `get`/`list`, pruned FIFO beyond these counts as jobs
    /// transition through `complete`/`fail`.
    pub async fn set_retention(&self, topic: impl Into<String>, retain_completed: usize, retain_failed: usize) {
        let mut inner = self.inner.lock().await;
        inner.retention.insert(topic.into(), (retain_completed, retain_failed));
    }

    /// Update a job's progress percent, clamped to 0..=100 and monotone
    /// non-decreasing, and broadcast a `JobEvent::Progress`.
    pub async fn update_progress(&self, job_id: JobId, percent: u8) -> Result<(), JobError> {
        let percent = percent.min(100);
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        let clamped = match job.progress {
            Some(existing) if existing > percent => existing,
            _ => percent,
        };
        job.progress = Some(clamped);
        drop(inner);

        let _ = self.events.send(JobEvent::Progress { job_id, percent: clamped, at: now });
        Ok(())
    }

    /// Accept a new job, making it eligible for dispatch once its delay
    /// (if any) elapses.
    pub async fn submit(&self, job: Job) -> JobId {
        let id = job.id;
        let topic = job.topic.clone();
        let key = waiting_key(&job);

        let mut inner = self.inner.lock().await;
        inner.waiting.entry(topic.clone()).or_default().insert(key);
        inner.jobs.insert(id, job);
        drop(inner);

        debug!(job_id = %id, topic = %topic, "job submitted");
        let _ = self.events.send(JobEvent::Submitted {
            job_id: id,
            topic,
            at: Utc::now(),
        });
        id
    }

    /// Lease the next ready job for `topic`, if any. Scans the waiting
    /// index in dispatch order and returns the first entry whose delay
    /// has elapsed, so a not-yet-ready high priority job does not block
    /// a ready lower priority one.
    pub async fn dequeue(&self, topic: &str, worker_id: WorkerId) -> Option<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let ready_key = {
            let set = inner.waiting.get(topic)?;
            let mut found = None;
            for key in set.iter() {
                let job = inner.jobs.get(&key.3)?;
                if job.is_ready(now) {
                    found = Some(*key);
                    break;
                }
            }
            found
        }?;

        inner.waiting.get_mut(topic).unwrap().remove(&ready_key);

        let job_id = ready_key.3;
        let job = inner.jobs.get_mut(&job_id).expect("job indexed but missing");
        job.state = JobState::Active;
        job.attempts += 1;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id);
        let timeout = job.timeout;
        let attempt = job.attempts;
        let result = job.clone();

        inner.leases.insert(
            job_id,
            Lease {
                worker_id,
                expires_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300)),
            },
        );
        drop(inner);

        debug!(job_id = %job_id, %worker_id, attempt, "job leased");
        let _ = self.events.send(JobEvent::Started {
            job_id,
            worker_id,
            attempt,
            at: now,
        });
        Some(result)
    }

    /// Extend an active lease, used as a heartbeat for long-running jobs.
    pub async fn extend_lease(&self, job_id: JobId, extra: Duration) -> Result<(), JobError> {
        let mut inner = self.inner.lock().await;
        let lease = inner
            .leases
            .get_mut(&job_id)
            .ok_or(JobError::NotFound(job_id))?;
        lease.expires_at += chrono::Duration::from_std(extra).unwrap_or_default();
        Ok(())
    }

    /// Mark a job completed successfully.
    pub async fn complete(&self, job_id: JobId, data: Option<Vec<u8>>) -> Result<(), JobError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.leases.remove(&job_id);
        let job = inner.jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        job.state = JobState::Completed;
        job.finished_at = Some(now);
        job.result = data;
        let topic = job.topic.clone();
        let retain = inner.retention.get(&topic).map(|r| r.0).unwrap_or(usize::MAX);
        prune_terminal(&mut inner, &topic, JobState::Completed, retain);
        drop(inner);

        info!(job_id = %job_id, "job completed");
        let _ = self.events.send(JobEvent::Completed { job_id, at: now });
        Ok(())
    }

    /// Report a failed attempt. Re-queues with backoff if the job's
    /// retry policy permits another attempt and the handler marked the
    /// failure retryable; otherwise sends it to the dead-letter queue.
    pub async fn fail(&self, job_id: JobId, error: impl Into<String>, retryable: bool) -> Result<(), JobError> {
        let error = error.into();
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.leases.remove(&job_id);

        let job = inner.jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?.clone();
        let policy = inner
            .retry_policies
            .get(&job.topic)
            .cloned()
            .unwrap_or_default();

        let can_retry = retryable && job.can_retry() && job.attempts < policy.max_attempts().unwrap_or(u32::MAX);

        if can_retry {
            let delay = policy.delay_for(job.attempts);
            let delay_until = now + chrono::Duration::from_std(delay).unwrap_or_default();

            let history = inner.retry_history.entry(job_id).or_insert_with(RetryHistory::new);
            history.record(job.attempts, error.clone(), delay);

            let job_mut = inner.jobs.get_mut(&job_id).unwrap();
            job_mut.state = JobState::Delayed;
            job_mut.delay_until = Some(delay_until);
            job_mut.last_error = Some(error.clone());
            job_mut.worker_id = None;
            let key = waiting_key(job_mut);
            inner.waiting.entry(job.topic.clone()).or_default().insert(key);
            drop(inner);

            warn!(job_id = %job_id, attempt = job.attempts, %delay_until, "job failed, retry scheduled");
            let _ = self.events.send(JobEvent::Retrying {
                job_id,
                attempt: job.attempts,
                error,
                next_attempt_at: delay_until,
            });
        } else {
            let history = inner.retry_history.remove(&job_id).unwrap_or_default();

            let job_mut = inner.jobs.get_mut(&job_id).unwrap();
            job_mut.state = JobState::Failed;
            job_mut.finished_at = Some(now);
            job_mut.last_error = Some(error.clone());
            let dead = job_mut.clone();
            inner.dead_letters.push(dead, error.clone(), history);
            let retain = inner.retention.get(&job.topic).map(|r| r.1).unwrap_or(usize::MAX);
            prune_terminal(&mut inner, &job.topic, JobState::Failed, retain);
            drop(inner);

            warn!(job_id = %job_id, "job exhausted retries, moved to dead letter queue");
            let _ = self.events.send(JobEvent::Dead {
                job_id,
                error,
                at: now,
            });
        }
        Ok(())
    }

    /// Cancel a job. If it is waiting or delayed it is cancelled
    /// immediately; if it is active, cooperative cancellation is
    /// requested via `cancel_requested` and the worker observes it
    /// through `JobContext::is_cancelled`.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), JobError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;

        if job.state.is_terminal() {
            return Ok(());
        }

        if job.state == JobState::Active {
            job.cancel_requested = true;
            drop(inner);
            return Ok(());
        }

        job.state = JobState::Cancelled;
        job.finished_at = Some(now);
        let topic = job.topic.clone();
        let key = waiting_key(job);
        if let Some(set) = inner.waiting.get_mut(&topic) {
            set.remove(&key);
        }
        drop(inner);

        info!(job_id = %job_id, "job cancelled");
        let _ = self.events.send(JobEvent::Cancelled { job_id, at: now });
        Ok(())
    }

    /// Sweep leases whose visibility timeout has elapsed, returning
    /// them to `waiting` (or the dead-letter queue if out of retries).
    /// Called periodically by the worker pool supervisor.
    pub async fn reclaim_expired_leases(&self) -> Vec<JobId> {
        let now = Utc::now();
        let expired: Vec<JobId> = {
            let inner = self.inner.lock().await;
            inner
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| *id)
                .collect()
        };

        for job_id in &expired {
            warn!(job_id = %job_id, "lease expired, reclaiming job");
            let _ = self.fail(*job_id, "lease expired (visibility timeout)", true).await;
        }
        expired
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    /// Filter jobs by topic, state, and/or tags.
    pub async fn list(&self, query: &JobQuery) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| query.topic.as_deref().map_or(true, |t| t == j.topic))
            .filter(|j| query.state.map_or(true, |s| s == j.state))
            .filter(|j| query.tags.iter().all(|t| j.tags.contains(t)))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        out
    }

    /// Drop all jobs and indices for a topic. Leaves the dead-letter
    /// queue untouched.
    pub async fn clear(&self, topic: &str) {
        let mut inner = self.inner.lock().await;
        inner.waiting.remove(topic);
        inner.jobs.retain(|_, j| j.topic != topic);
    }

    /// Number of jobs waiting or delayed for a topic.
    pub async fn waiting_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .await
            .waiting
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Number of jobs currently leased to a worker.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    /// Read-only access to the dead-letter queue's contents.
    pub async fn dead_letters(&self) -> Vec<super::dead_letter::DeadLetter> {
        self.inner.lock().await.dead_letters.iter().cloned().collect()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn test_priority_ordering_dispatch() {
        let queue = JobQueue::default();
        let low = Job::new("t", vec![]).with_priority(1);
        let high = Job::new("t", vec![]).with_priority(10);
        queue.submit(low.clone()).await;
        queue.submit(high.clone()).await;

        let leased = queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        assert_eq!(leased.id, high.id);
    }

    #[tokio::test]
    async fn test_fifo_tiebreak_same_priority() {
        let queue = JobQueue::default();
        let first = Job::new("t", vec![]);
        tokio::time::sleep(StdDuration::from_millis(2)).await;
        let second = Job::new("t", vec![]);
        queue.submit(second.clone()).await;
        queue.submit(first.clone()).await;

        let leased = queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        assert_eq!(leased.id, first.id);
    }

    #[tokio::test]
    async fn test_delayed_job_not_dispatched_until_ready() {
        let queue = JobQueue::default();
        let future = Utc::now() + chrono::Duration::seconds(3600);
        let delayed = Job::new("t", vec![]).with_delay_until(future);
        queue.submit(delayed).await;

        assert!(queue.dequeue("t", WorkerId::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_complete_marks_job_terminal() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;
        queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        queue.complete(id, None).await.unwrap();

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_fail_retryable_reschedules_job() {
        let queue = JobQueue::default();
        queue.set_retry_policy("t", RetryPolicy::Fixed {
            delay: StdDuration::from_millis(1),
            max_attempts: 3,
        }).await;
        let job = Job::new("t", vec![]).with_max_attempts(3);
        let id = job.id;
        queue.submit(job).await;
        queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        queue.fail(id, "boom", true).await.unwrap();

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_fail_non_retryable_goes_to_dead_letter() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;
        queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        queue.fail(id, "fatal", false).await.unwrap();

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(queue.dead_letters().await.iter().any(|d| d.job.id == id));
    }

    #[tokio::test]
    async fn test_cancel_waiting_job_is_immediate() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;
        queue.cancel(id).await.unwrap();

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        assert!(queue.dequeue("t", WorkerId::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_active_job_requests_cooperative_cancel() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;
        queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
        queue.cancel(id).await.unwrap();

        let stored = queue.get(id).await.unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest_completed_jobs() {
        let queue = JobQueue::default();
        queue.set_retention("t", 1, 1000).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = Job::new("t", vec![]);
            let id = job.id;
            queue.submit(job).await;
            queue.dequeue("t", WorkerId::new_v4()).await.unwrap();
            queue.complete(id, None).await.unwrap();
            ids.push(id);
            tokio::time::sleep(StdDuration::from_millis(2)).await;
        }

        assert!(queue.get(ids[0]).await.is_none());
        assert!(queue.get(ids[1]).await.is_none());
        assert!(queue.get(ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn test_update_progress_is_monotone_non_decreasing() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]);
        let id = job.id;
        queue.submit(job).await;

        queue.update_progress(id, 40).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().progress, Some(40));

        queue.update_progress(id, 10).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().progress, Some(40));

        queue.update_progress(id, 200).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().progress, Some(100));
    }

    #[tokio::test]
    async fn test_reclaim_expired_lease_requeues_job() {
        let queue = JobQueue::default();
        let job = Job::new("t", vec![]).with_timeout(StdDuration::from_millis(1));
        let id = job.id;
        queue.submit(job).await;
        queue.dequeue("t", WorkerId::new_v4()).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let reclaimed = queue.reclaim_expired_leases().await;
        assert_eq!(reclaimed, vec![id]);

        let stored = queue.get(id).await.unwrap();
        assert!(stored.state == JobState::Delayed || stored.state == JobState::Waiting);
    }
}
