//! End-to-end scenarios exercising the in-process queue, worker pool,
//! cache and scheduler together, without any external services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskforge::cache::external::FakeBackend;
use taskforge::cache::{ExternalBackend, LayeredCache};
use taskforge::jobs::{
    ExponentialBackoff, Job, JobContext, JobHandler, JobManager, JobManagerConfig, JobQuery, JobResult, JobState,
    RetryPolicy, SubmitOptions,
};
use taskforge::scheduler::{calculate_next_run, parse_timezone, validate_cron};

struct RecordingHandler {
    fail_until_attempt: u32,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, ctx: JobContext, payload: Vec<u8>) -> JobResult {
        if ctx.attempt < self.fail_until_attempt {
            JobResult::failure("not yet", true)
        } else {
            JobResult::success(Some(payload))
        }
    }
}

struct SlowHandler {
    delay: Duration,
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _ctx: JobContext, _payload: Vec<u8>) -> JobResult {
        tokio::time::sleep(self.delay).await;
        JobResult::success(None)
    }
}

struct CooperativeHandler;

#[async_trait]
impl JobHandler for CooperativeHandler {
    async fn handle(&self, ctx: JobContext, _payload: Vec<u8>) -> JobResult {
        for _ in 0..50 {
            if ctx.is_cancelled() {
                return JobResult::failure("cancelled", false);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        JobResult::success(None)
    }
}

async fn wait_until_terminal(manager: &JobManager, id: uuid::Uuid) -> Job {
    for _ in 0..100 {
        if let Some(job) = manager.status(id).await {
            if job.state.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job did not reach a terminal state in time");
}

async fn wait_until_active(manager: &JobManager, id: uuid::Uuid) -> Job {
    for _ in 0..100 {
        if let Some(job) = manager.status(id).await {
            if job.state == JobState::Active {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job did not become active in time");
}

/// S1: among waiting jobs, higher priority dispatches first regardless
/// of submission order.
#[tokio::test]
async fn scenario_priority_ordering() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager
        .register_handler("priorities", Arc::new(RecordingHandler { fail_until_attempt: 0 }), vec![])
        .await
        .unwrap();
    // development() starts one worker per topic; its poll loop sleeps
    // between empty dequeues for longer than these two submits take, so
    // both land in the waiting set before the next dispatch.
    manager.scale_topic("priorities", 1).await.unwrap();

    let low = manager
        .submit("priorities", b"low".to_vec(), SubmitOptions {
            priority: Some(1.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let high = manager
        .submit("priorities", b"high".to_vec(), SubmitOptions {
            priority: Some(10.into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let high_job = wait_until_terminal(&manager, high).await;

    let low_job = manager.status(low).await.unwrap();
    assert_eq!(high_job.state, JobState::Completed);
    // the low priority job should not have started before the high one finished,
    // i.e. it is still waiting or just started after.
    assert_ne!(low_job.state, JobState::Active);

    manager.shutdown().await;
}

/// S2: a job that fails retryable attempts eventually succeeds after
/// exponential backoff retries, without exceeding max_attempts. With
/// base=100ms, cap=1s and a third-attempt success, at least the first
/// two backoff delays (100ms + 200ms = 300ms) must elapse before the
/// job reaches a terminal state.
#[tokio::test]
async fn scenario_retry_with_backoff_then_success() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager
        .register_handler("retries", Arc::new(RecordingHandler { fail_until_attempt: 3 }), vec![])
        .await
        .unwrap();
    manager
        .set_retry_policy(
            "retries",
            RetryPolicy::Exponential(ExponentialBackoff {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.0,
                max_attempts: 3,
            }),
        )
        .await;

    let started = std::time::Instant::now();
    let id = manager
        .submit("retries", b"payload".to_vec(), SubmitOptions {
            max_attempts: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();

    let job = wait_until_terminal(&manager, id).await;
    let elapsed = started.elapsed();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 3);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?} was under the 300ms backoff floor", elapsed);

    manager.shutdown().await;
}

/// S3: a handler that never returns within the per-attempt timeout is
/// treated as a failed, retryable attempt.
#[tokio::test]
async fn scenario_per_attempt_timeout() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager
        .register_handler(
            "slow",
            Arc::new(SlowHandler { delay: Duration::from_secs(5) }),
            vec![],
        )
        .await
        .unwrap();

    let id = manager
        .submit("slow", vec![], SubmitOptions {
            timeout_ms: Some(50),
            max_attempts: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    let job = wait_until_terminal(&manager, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.as_deref().unwrap_or("").contains("timed out"));

    manager.shutdown().await;
}

/// S4: cancelling a job that has not started dispatch removes it from
/// the waiting set immediately.
#[tokio::test]
async fn scenario_cancel_waiting_job() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager
        .register_handler("cancel-me", Arc::new(RecordingHandler { fail_until_attempt: 0 }), vec![])
        .await
        .unwrap();
    manager.scale_topic("cancel-me", 0).await.unwrap();

    let id = manager
        .submit("cancel-me", vec![], SubmitOptions::default())
        .await
        .unwrap();
    manager.cancel(id).await.unwrap();

    let job = manager.status(id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    manager.shutdown().await;
}

/// S4b: cancelling an active job sets cooperative cancellation, which a
/// well-behaved handler observes and exits on.
#[tokio::test]
async fn scenario_cancel_active_job_is_observed_by_handler() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager.register_handler("cooperative", Arc::new(CooperativeHandler), vec![]).await.unwrap();

    let id = manager
        .submit("cooperative", vec![], SubmitOptions {
            timeout_ms: Some(5000),
            max_attempts: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    wait_until_active(&manager, id).await;

    manager.cancel(id).await.unwrap();

    let job = wait_until_terminal(&manager, id).await;
    assert_eq!(job.state, JobState::Failed);

    manager.shutdown().await;
}

/// S5: the layered cache promotes an external-tier hit into memory so
/// the next read is local.
#[tokio::test]
async fn scenario_cache_promotion_on_external_hit() {
    let external = Arc::new(FakeBackend::new());
    external.set("warm", b"value".to_vec(), None).await.unwrap();
    let cache = LayeredCache::new(16, 1024 * 1024, external, Duration::from_secs(60));

    assert_eq!(cache.get("warm").await.unwrap(), Some(b"value".to_vec()));
    assert_eq!(cache.stats().external_hits(), 1);
    assert_eq!(cache.stats().memory_hits(), 0);

    assert_eq!(cache.get("warm").await.unwrap(), Some(b"value".to_vec()));
    assert_eq!(cache.stats().memory_hits(), 1);
}

/// S6: a cron expression scheduled across a DST spring-forward boundary
/// resolves to a valid, later instant rather than panicking or landing
/// on the skipped hour.
#[test]
fn scenario_cron_dst_spring_forward() {
    assert!(validate_cron("0 30 2 * * *").is_ok());
    let tz = parse_timezone("America/New_York").unwrap();
    let before = chrono::DateTime::parse_from_rfc3339("2026-03-07T12:00:00-05:00")
        .unwrap()
        .with_timezone(&chrono::Utc);

    let first = calculate_next_run("0 30 2 * * *", tz, before).unwrap();
    let second = calculate_next_run("0 30 2 * * *", tz, first).unwrap();

    assert!(first > before);
    assert!(second > first);
}

/// Invariant: a job never double-executes concurrently — leasing it
/// once makes it unavailable to a second dequeue until it completes or
/// its lease expires.
#[tokio::test]
async fn invariant_single_lease_per_job() {
    use taskforge::jobs::queue::JobQueue as RawJobQueue;
    let queue = RawJobQueue::default();
    let job = Job::new("excl", vec![]);
    let id = job.id;
    queue.submit(job).await;

    let first = queue.dequeue("excl", uuid::Uuid::new_v4()).await;
    assert!(first.is_some());
    let second = queue.dequeue("excl", uuid::Uuid::new_v4()).await;
    assert!(second.is_none());

    queue.complete(id, None).await.unwrap();
}

/// Invariant: listing jobs by topic and state only returns matches.
#[tokio::test]
async fn invariant_list_filters_by_topic_and_state() {
    let manager = JobManager::new(JobManagerConfig::development());
    manager.register_handler("a", Arc::new(RecordingHandler { fail_until_attempt: 0 }), vec![]).await.unwrap();
    manager.register_handler("b", Arc::new(RecordingHandler { fail_until_attempt: 0 }), vec![]).await.unwrap();
    manager.scale_topic("a", 0).await.unwrap();
    manager.scale_topic("b", 0).await.unwrap();

    manager.submit("a", vec![], SubmitOptions::default()).await.unwrap();
    manager.submit("b", vec![], SubmitOptions::default()).await.unwrap();

    let only_a = manager
        .list(JobQuery {
            topic: Some("a".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].topic, "a");

    manager.shutdown().await;
}
