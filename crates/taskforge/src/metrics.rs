//! Cross-component metrics and health roll-up.
//!
//! Snapshots the counters the job manager, cache, resource manager and
//! load balancer already maintain in-process into one `MetricsSummary`,
//! rather than pushing every event into an external metrics store.

use std::sync::Arc;

use serde::Serialize;

use crate::balancer::LoadBalancer;
use crate::cache::LayeredCache;
use crate::jobs::JobManager;
use crate::resource::ResourceManager;

/// Per-topic processing snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TopicMetrics {
    pub topic: String,
    pub workers: usize,
    pub waiting: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl TopicMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.failed as f64 / self.processed as f64
    }
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate snapshot across the job, cache, resource and load balancer
/// subsystems.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub topics: Vec<TopicMetrics>,
    pub active_jobs: usize,
    pub dead_letter_count: usize,
    pub cache_hit_rate: f64,
    pub resource_inflight: usize,
    pub resource_total_permits: usize,
    pub resource_avg_duration_ms: i64,
    pub balancer_healthy_backends: usize,
    pub status: HealthStatus,
}

impl MetricsSummary {
    pub fn format(&self) -> String {
        let mut lines = vec![format!(
            "status={:?} active_jobs={} dead_letters={} cache_hit_rate={:.1}% resource={}/{} avg_duration={}ms healthy_backends={}",
            self.status,
            self.active_jobs,
            self.dead_letter_count,
            self.cache_hit_rate * 100.0,
            self.resource_inflight,
            self.resource_total_permits,
            self.resource_avg_duration_ms,
            self.balancer_healthy_backends,
        )];
        for topic in &self.topics {
            lines.push(format!(
                "  {}: workers={} waiting={} processed={} failure_rate={:.1}%",
                topic.topic,
                topic.workers,
                topic.waiting,
                topic.processed,
                topic.failure_rate() * 100.0
            ));
        }
        lines.join("\n")
    }
}

/// Failure rate, past which a topic is considered degraded.
const DEGRADED_FAILURE_RATE: f64 = 0.1;

/// Failure rate, past which a topic is considered unhealthy.
const UNHEALTHY_FAILURE_RATE: f64 = 0.5;

/// Snapshots every registered component into one `MetricsSummary`.
pub struct MetricsCollector {
    jobs: Arc<JobManager>,
    cache: Option<Arc<LayeredCache>>,
    resources: Option<Arc<ResourceManager>>,
    balancer: Option<Arc<LoadBalancer>>,
}

impl MetricsCollector {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self {
            jobs,
            cache: None,
            resources: None,
            balancer: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<LayeredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_resources(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub async fn snapshot(&self) -> MetricsSummary {
        let topic_names = self.jobs.topics().await;
        let topics = futures::future::join_all(topic_names.into_iter().map(|topic| async move {
            let (processed, succeeded, failed) = self.jobs.pool_stats(&topic).await.unwrap_or((0, 0, 0));
            TopicMetrics {
                workers: self.jobs.worker_count(&topic).await.unwrap_or(0),
                waiting: self.jobs.waiting_count(&topic).await,
                topic,
                processed,
                succeeded,
                failed,
            }
        }))
        .await;

        let active_jobs = self.jobs.active_count().await;
        let dead_letter_count = self.jobs.dead_letter_count().await;
        let cache_hit_rate = self.cache.as_ref().map(|c| c.stats().hit_rate()).unwrap_or(0.0);
        let (resource_inflight, resource_total_permits, resource_avg_duration_ms) = self
            .resources
            .as_ref()
            .map(|r| (r.inflight(), r.total_permits(), r.avg_duration_ms()))
            .unwrap_or((0, 0, 0));
        let balancer_healthy_backends = self.balancer.as_ref().map(|b| b.healthy_count()).unwrap_or(0);

        let worst_failure_rate = topics.iter().map(|t| t.failure_rate()).fold(0.0_f64, f64::max);
        let status = if worst_failure_rate >= UNHEALTHY_FAILURE_RATE {
            HealthStatus::Unhealthy
        } else if worst_failure_rate >= DEGRADED_FAILURE_RATE || dead_letter_count > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        MetricsSummary {
            topics,
            active_jobs,
            dead_letter_count,
            cache_hit_rate,
            resource_inflight,
            resource_total_permits,
            resource_avg_duration_ms,
            balancer_healthy_backends,
            status,
        }
    }
}
