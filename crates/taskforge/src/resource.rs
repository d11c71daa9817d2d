//! Admission control and adaptive concurrency scaling.
//!
//! Concurrency is bounded by a `tokio::sync::Semaphore`; a second,
//! independent ledger tracks bytes reserved against a memory budget per
//! in-flight job, so a worker can be admitted on concurrency alone and
//! still be rejected if its declared `memory_requirement` would blow
//! the budget. Autoscale decisions are computed from caller-reported
//! CPU load and memory utilization samples (EWMA smoothed, alpha as a
//! percentage) against fixed thresholds, and enacting a decision is
//! gated by a scaling policy rather than applied unconditionally.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::jobs::Job;

fn default_min_permits() -> usize {
    1
}

fn default_max_permits() -> usize {
    64
}

fn default_initial_permits() -> usize {
    8
}

fn default_memory_budget_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_cpu_threshold() -> f64 {
    0.7
}

fn default_ewma_alpha_pct() -> u32 {
    20
}

fn default_queued_high_watermark() -> usize {
    5
}

fn default_scaling_policy() -> ScalingPolicy {
    ScalingPolicy::Conservative
}

/// Governs which autoscale decisions `apply_decision` is allowed to
/// enact on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingPolicy {
    /// Enact every decision, including `NoAction`.
    Aggressive,
    /// Enact only decisions tagged `ScalePriority::High`.
    Conservative,
    /// Never enact anything; `autoscale_decision` is advisory only and
    /// an external caller decides whether to act on it.
    Manual,
}

/// Relative urgency of a scale-up decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalePriority {
    Medium,
    High,
}

/// The outcome of evaluating current load against the autoscale
/// thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscaleDecision {
    /// Queue pressure with headroom on both CPU and memory.
    ScaleUp { target: usize, priority: ScalePriority },
    /// CPU or memory is past its stress threshold; scale up harder.
    ScaleUpStress { target: usize, priority: ScalePriority },
    /// Nothing in flight or queued; collapse to a single worker.
    ScaleDown { target: usize },
    /// Load is comfortably low; ease off by one worker.
    ScaleDownLow { target: usize },
    /// No threshold crossed.
    NoAction,
}

impl AutoscaleDecision {
    pub fn target(&self) -> Option<usize> {
        match self {
            AutoscaleDecision::ScaleUp { target, .. }
            | AutoscaleDecision::ScaleUpStress { target, .. }
            | AutoscaleDecision::ScaleDown { target }
            | AutoscaleDecision::ScaleDownLow { target } => Some(*target),
            AutoscaleDecision::NoAction => None,
        }
    }

    pub fn priority(&self) -> Option<ScalePriority> {
        match self {
            AutoscaleDecision::ScaleUp { priority, .. } | AutoscaleDecision::ScaleUpStress { priority, .. } => {
                Some(*priority)
            }
            _ => None,
        }
    }

    pub fn is_no_action(&self) -> bool {
        matches!(self, AutoscaleDecision::NoAction)
    }
}

/// Configuration for a `ResourceManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    #[serde(default = "default_min_permits")]
    pub min_permits: usize,

    #[serde(default = "default_max_permits")]
    pub max_permits: usize,

    #[serde(default = "default_initial_permits")]
    pub initial_permits: usize,

    /// Total bytes jobs may reserve against at once via `try_acquire`.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,

    /// CPU load fraction (0.0-1.0) above which the manager treats the
    /// host as under stress.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    /// EWMA smoothing factor as a percentage (0-100) for both the load
    /// estimate and the duration tracker.
    #[serde(default = "default_ewma_alpha_pct")]
    pub ewma_alpha_pct: u32,

    /// Queued-job count past which a scale-up is tagged `High` priority
    /// instead of `Medium`.
    #[serde(default = "default_queued_high_watermark")]
    pub queued_high_watermark: usize,

    #[serde(default = "default_scaling_policy")]
    pub policy: ScalingPolicy,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            min_permits: default_min_permits(),
            max_permits: default_max_permits(),
            initial_permits: default_initial_permits(),
            memory_budget_bytes: default_memory_budget_bytes(),
            cpu_threshold: default_cpu_threshold(),
            ewma_alpha_pct: default_ewma_alpha_pct(),
            queued_high_watermark: default_queued_high_watermark(),
            policy: default_scaling_policy(),
        }
    }
}

/// A leased slot of concurrency capacity with a memory reservation
/// attached. Dropping it returns the permit to the pool and releases
/// the reservation back to the budget.
pub struct ResourcePermit {
    _permit: OwnedSemaphorePermit,
    memory_bytes: u64,
    memory_reserved: Arc<AtomicU64>,
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        if self.memory_bytes > 0 {
            self.memory_reserved.fetch_sub(self.memory_bytes, Ordering::Relaxed);
        }
    }
}

/// Bounds concurrent work against both a slot count and a memory
/// budget, and recommends autoscale decisions from reported load.
pub struct ResourceManager {
    semaphore: Arc<Semaphore>,
    reserved: Mutex<Vec<OwnedSemaphorePermit>>,
    total_permits: AtomicUsize,
    inflight: AtomicUsize,
    avg_duration_ms: AtomicI64,
    memory_reserved_bytes: Arc<AtomicU64>,
    cpu_load: Mutex<f64>,
    memory_utilization: Mutex<f64>,
    config: ResourceManagerConfig,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        let initial = config.initial_permits.clamp(config.min_permits, config.max_permits);
        Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            reserved: Mutex::new(Vec::new()),
            total_permits: AtomicUsize::new(initial),
            inflight: AtomicUsize::new(0),
            avg_duration_ms: AtomicI64::new(0),
            memory_reserved_bytes: Arc::new(AtomicU64::new(0)),
            cpu_load: Mutex::new(0.0),
            memory_utilization: Mutex::new(0.0),
            config,
        }
    }

    /// Try to admit one unit of work without blocking, reserving
    /// `job.memory_requirement` bytes against the memory budget.
    /// Rejects admission (releasing any concurrency slot already taken)
    /// if the reservation would exceed the budget.
    pub fn try_acquire(self: &Arc<Self>, job: &Job) -> Result<ResourcePermit, crate::Error> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| crate::Error::admission("resource pool at capacity"))?;

        let requirement = job.memory_requirement;
        if requirement > 0 {
            let reserved = self.memory_reserved_bytes.fetch_add(requirement, Ordering::Relaxed) + requirement;
            if reserved > self.config.memory_budget_bytes {
                self.memory_reserved_bytes.fetch_sub(requirement, Ordering::Relaxed);
                return Err(crate::Error::admission(format!(
                    "memory budget exhausted: {reserved} bytes reserved exceeds budget of {} bytes",
                    self.config.memory_budget_bytes
                )));
            }
        }

        self.inflight.fetch_add(1, Ordering::Relaxed);
        Ok(ResourcePermit {
            _permit: permit,
            memory_bytes: requirement,
            memory_reserved: Arc::clone(&self.memory_reserved_bytes),
        })
    }

    /// Try to admit one unit of work without a memory reservation,
    /// bounded only by the concurrency slot count.
    pub fn try_admit(self: &Arc<Self>) -> Result<ResourcePermit, crate::Error> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.inflight.fetch_add(1, Ordering::Relaxed);
                Ok(ResourcePermit {
                    _permit: permit,
                    memory_bytes: 0,
                    memory_reserved: Arc::clone(&self.memory_reserved_bytes),
                })
            }
            Err(_) => Err(crate::Error::admission("resource pool at capacity")),
        }
    }

    /// Admit one unit of work, waiting for capacity if needed.
    pub async fn admit(self: &Arc<Self>) -> ResourcePermit {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.expect("semaphore never closed");
        self.inflight.fetch_add(1, Ordering::Relaxed);
        ResourcePermit {
            _permit: permit,
            memory_bytes: 0,
            memory_reserved: Arc::clone(&self.memory_reserved_bytes),
        }
    }

    /// Feed a completed job's duration into the load estimate.
    pub fn record_duration(&self, duration: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        let sample = duration.as_millis() as i64;
        let alpha = self.config.ewma_alpha_pct as i64;
        let old = self.avg_duration_ms.load(Ordering::Relaxed);
        let updated = if old == 0 { sample } else { old + (sample - old) * alpha / 100 };
        self.avg_duration_ms.store(updated, Ordering::Relaxed);
    }

    /// Feed a fresh CPU/memory load sample into the EWMA estimates that
    /// `autoscale_decision` evaluates against.
    pub fn record_load(&self, cpu_load: f64, memory_utilization: f64) {
        let alpha = self.config.ewma_alpha_pct as f64 / 100.0;
        let mut cpu = self.cpu_load.lock();
        *cpu = *cpu + (cpu_load.clamp(0.0, 1.0) - *cpu) * alpha;
        drop(cpu);
        let mut mem = self.memory_utilization.lock();
        *mem = *mem + (memory_utilization.clamp(0.0, 1.0) - *mem) * alpha;
    }

    pub fn cpu_load(&self) -> f64 {
        *self.cpu_load.lock()
    }

    pub fn memory_utilization(&self) -> f64 {
        *self.memory_utilization.lock()
    }

    pub fn avg_duration_ms(&self) -> i64 {
        self.avg_duration_ms.load(Ordering::Relaxed)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn total_permits(&self) -> usize {
        self.total_permits.load(Ordering::Relaxed)
    }

    pub fn memory_reserved_bytes(&self) -> u64 {
        self.memory_reserved_bytes.load(Ordering::Relaxed)
    }

    /// Evaluate the current load/queue state against the autoscale
    /// thresholds. Purely advisory: does not change `total_permits` by
    /// itself, see `apply_decision`.
    pub fn autoscale_decision(&self, queued_jobs: usize, active_jobs: usize) -> AutoscaleDecision {
        let current = self.total_permits();
        let cpu = self.cpu_load();
        let memory = self.memory_utilization();

        if (cpu > self.config.cpu_threshold || memory > 0.9) && active_jobs < self.config.max_permits {
            return AutoscaleDecision::ScaleUpStress {
                target: (current + 2).min(self.config.max_permits),
                priority: ScalePriority::High,
            };
        }

        if queued_jobs > 0 && active_jobs < self.config.max_permits && cpu < self.config.cpu_threshold && memory < 0.8 {
            let priority = if queued_jobs > self.config.queued_high_watermark {
                ScalePriority::High
            } else {
                ScalePriority::Medium
            };
            return AutoscaleDecision::ScaleUp {
                target: (current + 1).min(self.config.max_permits),
                priority,
            };
        }

        if active_jobs == 0 && queued_jobs == 0 && current > 1 {
            return AutoscaleDecision::ScaleDown { target: 1 };
        }

        if cpu < 0.3 && memory < 0.4 && queued_jobs == 0 && current > 1 {
            return AutoscaleDecision::ScaleDownLow {
                target: (current - 1).max(self.config.min_permits),
            };
        }

        AutoscaleDecision::NoAction
    }

    /// Apply a decision subject to the configured `ScalingPolicy`.
    /// Returns whether the decision was actually enacted.
    pub async fn apply_decision(self: &Arc<Self>, decision: AutoscaleDecision) -> bool {
        let should_enact = match self.config.policy {
            ScalingPolicy::Aggressive => !decision.is_no_action(),
            ScalingPolicy::Conservative => decision.priority() == Some(ScalePriority::High),
            ScalingPolicy::Manual => false,
        };

        if !should_enact {
            return false;
        }

        let Some(target) = decision.target() else {
            return false;
        };

        self.scale_to(target).await;
        true
    }

    /// Grow or shrink the effective concurrency bound toward `target`,
    /// one permit at a time, without disturbing in-flight leases.
    /// Shrinking reserves a permit (removing it from circulation);
    /// growing releases a previously reserved permit or adds a new one.
    pub async fn scale_to(self: &Arc<Self>, target: usize) {
        let target = target.clamp(self.config.min_permits, self.config.max_permits);

        loop {
            let current = self.total_permits();
            if target == current {
                return;
            }

            if target < current {
                match Arc::clone(&self.semaphore).try_acquire_owned() {
                    Ok(permit) => {
                        self.reserved.lock().push(permit);
                        self.total_permits.fetch_sub(1, Ordering::Relaxed);
                        debug!(permits = current - 1, "resource manager scaled down");
                    }
                    Err(_) => {
                        warn!("resource manager wanted to scale down but no idle permit was available");
                        return;
                    }
                }
            } else {
                let released = self.reserved.lock().pop();
                match released {
                    Some(permit) => drop(permit),
                    None => self.semaphore.add_permits(1),
                }
                self.total_permits.fetch_add(1, Ordering::Relaxed);
                info!(permits = current + 1, "resource manager scaled up");
            }
        }
    }
}
