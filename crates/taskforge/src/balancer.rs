//! Load balancing across a pool of backend targets.
//!
//! Backends live in a `dashmap`-guarded registry with atomic per-entry
//! counters, so health changes and connection accounting never need a
//! write lock on the whole table.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors raised by the load balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("no healthy backends available")]
    NoHealthyBackends,

    #[error("backend '{0}' not found")]
    NotFound(String),
}

/// Probes a backend's reachability and latency. Production callers
/// implement this against their actual transport (HTTP, gRPC, a raw TCP
/// connect); tests can substitute a fake.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> Result<Duration, BalancerError>;
}

/// Snapshot of one backend's counters, for operator-facing summaries.
#[derive(Debug, Clone)]
pub struct BackendStats {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub active_connections: usize,
    pub total_requests: usize,
    pub response_time_ms: f64,
}

/// Backend selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRandom,
    LeastConnections,
    IpHash,
}

struct BackendEntry {
    address: String,
    weight: u32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    total_requests: AtomicUsize,
    response_time_ms: Mutex<f64>,
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_unhealthy_threshold_ms() -> u64 {
    1000
}

fn default_ewma_alpha() -> f64 {
    0.2
}

/// Health-probe cadence and the latency bar a probe must stay under to
/// keep a backend eligible.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub probe_interval: Duration,
    pub unhealthy_threshold: Duration,
    pub response_time_ewma_alpha: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(default_probe_interval_ms()),
            unhealthy_threshold: Duration::from_millis(default_unhealthy_threshold_ms()),
            response_time_ewma_alpha: default_ewma_alpha(),
        }
    }
}

/// A pool of backend targets balanced under one strategy.
pub struct LoadBalancer {
    backends: DashMap<String, Arc<BackendEntry>>,
    order: parking_lot::Mutex<Vec<String>>,
    strategy: Strategy,
    round_robin_cursor: AtomicUsize,
    config: LoadBalancerConfig,
    probe_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_config(strategy, LoadBalancerConfig::default())
    }

    pub fn with_config(strategy: Strategy, config: LoadBalancerConfig) -> Self {
        Self {
            backends: DashMap::new(),
            order: parking_lot::Mutex::new(Vec::new()),
            strategy,
            round_robin_cursor: AtomicUsize::new(0),
            config,
            probe_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn add_backend(&self, id: impl Into<String>, address: impl Into<String>, weight: u32) {
        let id = id.into();
        self.backends.insert(
            id.clone(),
            Arc::new(BackendEntry {
                address: address.into(),
                weight: weight.max(1),
                healthy: AtomicBool::new(true),
                active_connections: AtomicUsize::new(0),
                total_requests: AtomicUsize::new(0),
                response_time_ms: Mutex::new(0.0),
            }),
        );
        self.order.lock().push(id.clone());
        info!(backend_id = %id, "backend added to load balancer");
    }

    pub fn remove_backend(&self, id: &str) {
        self.backends.remove(id);
        self.order.lock().retain(|b| b != id);
    }

    pub fn set_healthy(&self, id: &str, healthy: bool) -> Result<(), BalancerError> {
        let entry = self.backends.get(id).ok_or_else(|| BalancerError::NotFound(id.to_string()))?;
        let was_healthy = entry.healthy.swap(healthy, Ordering::Relaxed);
        if was_healthy != healthy {
            warn!(backend_id = %id, healthy, "backend health changed");
        }
        Ok(())
    }

    /// Record an observed response time against `id`, folding it into
    /// its EWMA. Used both by callers timing real dispatches and by the
    /// health-probe loop.
    pub fn record_response_time(&self, id: &str, observed: Duration) {
        if let Some(entry) = self.backends.get(id) {
            let sample = observed.as_secs_f64() * 1000.0;
            let mut ewma = entry.response_time_ms.lock();
            *ewma = if *ewma == 0.0 {
                sample
            } else {
                self.config.response_time_ewma_alpha * sample + (1.0 - self.config.response_time_ewma_alpha) * *ewma
            };
        }
    }

    /// Snapshot of every backend's counters.
    pub fn stats(&self) -> Vec<BackendStats> {
        self.order
            .lock()
            .iter()
            .filter_map(|id| {
                self.backends.get(id.as_str()).map(|e| BackendStats {
                    id: id.clone(),
                    address: e.address.clone(),
                    healthy: e.healthy.load(Ordering::Relaxed),
                    active_connections: e.active_connections.load(Ordering::Relaxed),
                    total_requests: e.total_requests.load(Ordering::Relaxed),
                    response_time_ms: *e.response_time_ms.lock(),
                })
            })
            .collect()
    }

    /// Run one round of health probes against every registered backend,
    /// marking unhealthy on probe failure or latency over
    /// `unhealthy_threshold`, and recording response time otherwise.
    pub async fn run_health_probe(&self, probe: &dyn HealthProbe) {
        let backends: Vec<(String, String)> =
            self.order.lock().iter().filter_map(|id| self.backends.get(id.as_str()).map(|e| (id.clone(), e.address.clone()))).collect();

        for (id, address) in backends {
            match probe.probe(&address).await {
                Ok(latency) if latency <= self.config.unhealthy_threshold => {
                    self.record_response_time(&id, latency);
                    let _ = self.set_healthy(&id, true);
                }
                Ok(latency) => {
                    debug!(backend_id = %id, ?latency, "probe latency exceeded unhealthy_threshold");
                    let _ = self.set_healthy(&id, false);
                }
                Err(e) => {
                    debug!(backend_id = %id, error = %e, "health probe failed");
                    let _ = self.set_healthy(&id, false);
                }
            }
        }
    }

    /// Start a background task that calls `run_health_probe` on
    /// `probe_interval`. The balancer must outlive the `Arc` for the
    /// loop to keep running; `shutdown` stops it.
    pub fn start_health_probe(self: &Arc<Self>, probe: Arc<dyn HealthProbe>) {
        let balancer = Arc::clone(self);
        let interval = self.config.probe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                balancer.run_health_probe(probe.as_ref()).await;
            }
        });
        *self.probe_handle.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.probe_handle.lock().take() {
            handle.abort();
        }
    }

    fn healthy_ids(&self) -> Vec<String> {
        self.order
            .lock()
            .iter()
            .filter(|id| {
                self.backends
                    .get(id.as_str())
                    .map(|e| e.healthy.load(Ordering::Relaxed))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Select a backend id according to the configured strategy.
    /// `affinity_key` is used only by `Strategy::IpHash`.
    pub fn select(&self, affinity_key: Option<&str>) -> Result<String, BalancerError> {
        let healthy = self.healthy_ids();
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackends);
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx].clone()
            }
            Strategy::WeightedRandom => self.weighted_random_pick(&healthy),
            Strategy::LeastConnections => self.least_connections_pick(&healthy),
            Strategy::IpHash => {
                let key = affinity_key.unwrap_or("");
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let idx = (hasher.finish() as usize) % healthy.len();
                healthy[idx].clone()
            }
        };

        if let Some(entry) = self.backends.get(&chosen) {
            entry.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        Ok(chosen)
    }

    fn weighted_random_pick(&self, healthy: &[String]) -> String {
        let total_weight: u32 = healthy
            .iter()
            .filter_map(|id| self.backends.get(id).map(|e| e.weight))
            .sum();
        let mut roll = rand::thread_rng().gen_range(0..total_weight.max(1));
        for id in healthy {
            if let Some(entry) = self.backends.get(id) {
                if roll < entry.weight {
                    return id.clone();
                }
                roll -= entry.weight;
            }
        }
        healthy[0].clone()
    }

    fn least_connections_pick(&self, healthy: &[String]) -> String {
        healthy
            .iter()
            .min_by(|a, b| {
                let (a_conn, a_rt) = self.connections_and_response_time(a);
                let (b_conn, b_rt) = self.connections_and_response_time(b);
                a_conn.cmp(&b_conn).then(a_rt.partial_cmp(&b_rt).unwrap_or(std::cmp::Ordering::Equal))
            })
            .cloned()
            .expect("healthy list is non-empty")
    }

    fn connections_and_response_time(&self, id: &str) -> (usize, f64) {
        self.backends
            .get(id)
            .map(|e| (e.active_connections.load(Ordering::Relaxed), *e.response_time_ms.lock()))
            .unwrap_or((usize::MAX, f64::MAX))
    }

    /// Record the start of a connection against `id`, for
    /// least-connections accounting.
    pub fn connection_started(&self, id: &str) {
        if let Some(entry) = self.backends.get(id) {
            entry.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_finished(&self, id: &str) {
        if let Some(entry) = self.backends.get(id) {
            entry.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn address_of(&self, id: &str) -> Result<String, BalancerError> {
        self.backends
            .get(id)
            .map(|e| e.address.clone())
            .ok_or_else(|| BalancerError::NotFound(id.to_string()))
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy_ids().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_backends() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 1);

        let first = lb.select(None).unwrap();
        let second = lb.select(None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_unhealthy_backend_is_skipped() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 1);
        lb.set_healthy("a", false).unwrap();

        for _ in 0..5 {
            assert_eq!(lb.select(None).unwrap(), "b");
        }
    }

    #[test]
    fn test_no_healthy_backends_errors() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.set_healthy("a", false).unwrap();
        assert!(matches!(lb.select(None), Err(BalancerError::NoHealthyBackends)));
    }

    #[test]
    fn test_least_connections_prefers_idle_backend() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 1);
        lb.connection_started("a");
        lb.connection_started("a");

        assert_eq!(lb.select(None).unwrap(), "b");
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let lb = LoadBalancer::new(Strategy::IpHash);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 1);

        let first = lb.select(Some("client-42")).unwrap();
        let second = lb.select(Some("client-42")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_least_connections_tie_breaks_on_response_time() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 1);
        lb.record_response_time("a", Duration::from_millis(50));
        lb.record_response_time("b", Duration::from_millis(5));

        assert_eq!(lb.select(None).unwrap(), "b");
    }

    #[test]
    fn test_record_response_time_builds_an_ewma() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.record_response_time("a", Duration::from_millis(100));
        lb.record_response_time("a", Duration::from_millis(100));

        let stats = lb.stats();
        let a = stats.iter().find(|s| s.id == "a").unwrap();
        assert!((a.response_time_ms - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_stats_reports_every_backend() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.add_backend("b", "10.0.0.2", 2);
        lb.select(None).unwrap();

        let stats = lb.stats();
        assert_eq!(stats.len(), 2);
        let total_requests: usize = stats.iter().map(|s| s.total_requests).sum();
        assert_eq!(total_requests, 1);
    }

    struct FakeProbe {
        latency: Duration,
        fails: bool,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, _address: &str) -> Result<Duration, BalancerError> {
            if self.fails {
                Err(BalancerError::NoHealthyBackends)
            } else {
                Ok(self.latency)
            }
        }
    }

    #[tokio::test]
    async fn test_health_probe_marks_unhealthy_over_latency_threshold() {
        let lb = LoadBalancer::with_config(
            Strategy::RoundRobin,
            LoadBalancerConfig {
                unhealthy_threshold: Duration::from_millis(100),
                ..Default::default()
            },
        );
        lb.add_backend("a", "10.0.0.1", 1);

        let slow = FakeProbe { latency: Duration::from_millis(500), fails: false };
        lb.run_health_probe(&slow).await;

        assert_eq!(lb.healthy_count(), 0);
    }

    #[tokio::test]
    async fn test_health_probe_marks_unhealthy_on_failure() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);

        let failing = FakeProbe { latency: Duration::from_millis(1), fails: true };
        lb.run_health_probe(&failing).await;

        assert_eq!(lb.healthy_count(), 0);
    }

    #[tokio::test]
    async fn test_health_probe_recovers_a_healthy_backend() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add_backend("a", "10.0.0.1", 1);
        lb.set_healthy("a", false).unwrap();

        let fast = FakeProbe { latency: Duration::from_millis(5), fails: false };
        lb.run_health_probe(&fast).await;

        assert_eq!(lb.healthy_count(), 1);
    }
}
