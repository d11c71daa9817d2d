//! Top-level configuration aggregate.
//!
//! Each component owns a `Serialize`/`Deserialize` config struct with
//! `#[serde(default = "...")]` field defaults, and this struct
//! aggregates them with `development()`/`production()` presets. No
//! file or environment loading is implemented here — that wiring is an
//! external-feature concern — but any `serde`-compatible loader can
//! deserialize straight into `Config`.

use serde::{Deserialize, Serialize};

use crate::balancer::{LoadBalancerConfig, Strategy};
use crate::jobs::JobManagerConfig;
use crate::resource::ResourceManagerConfig;
use crate::scheduler::SchedulerConfig;

fn default_memory_cache_capacity() -> usize {
    10_000
}

fn default_memory_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_promote_ttl_secs() -> u64 {
    300
}

fn default_compression_threshold_bytes() -> usize {
    1024
}

fn default_dead_letter_capacity() -> usize {
    1000
}

/// Configuration for the layered cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_memory_cache_capacity")]
    pub memory_capacity: usize,

    /// Total bytes the memory tier may hold across all entries; values
    /// that alone exceed this are rejected rather than evicting
    /// everything else to make room.
    #[serde(default = "default_memory_cache_max_bytes")]
    pub memory_max_bytes: usize,

    #[serde(default = "default_cache_promote_ttl_secs")]
    pub promote_ttl_secs: u64,

    /// Connection string for the external backend; `None` leaves the
    /// cache's external tier unconfigured (memory-only operation).
    #[serde(default)]
    pub external_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_cache_capacity(),
            memory_max_bytes: default_memory_cache_max_bytes(),
            promote_ttl_secs: default_cache_promote_ttl_secs(),
            external_url: None,
        }
    }
}

/// Configuration for the payload compression helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression_threshold_bytes")]
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_compression_threshold_bytes(),
        }
    }
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_unhealthy_threshold_ms() -> u64 {
    1000
}

fn default_response_time_ewma_alpha_pct() -> u8 {
    20
}

/// Configuration for the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_balancer_strategy")]
    pub strategy: BalancerStrategyConfig,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_unhealthy_threshold_ms")]
    pub unhealthy_threshold_ms: u64,

    /// EWMA smoothing factor for response time, as a 0..=100 percent.
    #[serde(default = "default_response_time_ewma_alpha_pct")]
    pub response_time_ewma_alpha_pct: u8,
}

impl From<BalancerConfig> for LoadBalancerConfig {
    fn from(c: BalancerConfig) -> Self {
        LoadBalancerConfig {
            probe_interval: std::time::Duration::from_millis(c.probe_interval_ms),
            unhealthy_threshold: std::time::Duration::from_millis(c.unhealthy_threshold_ms),
            response_time_ewma_alpha: c.response_time_ewma_alpha_pct as f64 / 100.0,
        }
    }
}

/// Serde-friendly mirror of `balancer::Strategy` (the real enum carries
/// no data to serialize against but lives in a module with no serde
/// dependency reason of its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerStrategyConfig {
    RoundRobin,
    WeightedRandom,
    LeastConnections,
    IpHash,
}

impl From<BalancerStrategyConfig> for Strategy {
    fn from(c: BalancerStrategyConfig) -> Self {
        match c {
            BalancerStrategyConfig::RoundRobin => Strategy::RoundRobin,
            BalancerStrategyConfig::WeightedRandom => Strategy::WeightedRandom,
            BalancerStrategyConfig::LeastConnections => Strategy::LeastConnections,
            BalancerStrategyConfig::IpHash => Strategy::IpHash,
        }
    }
}

fn default_balancer_strategy() -> BalancerStrategyConfig {
    BalancerStrategyConfig::RoundRobin
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_balancer_strategy(),
            probe_interval_ms: default_probe_interval_ms(),
            unhealthy_threshold_ms: default_unhealthy_threshold_ms(),
            response_time_ewma_alpha_pct: default_response_time_ewma_alpha_pct(),
        }
    }
}

/// Aggregate configuration for the whole substrate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub jobs: JobManagerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfigOwned,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub resources: ResourceManagerConfig,
}

/// `scheduler::SchedulerConfig` has no serde derive (its only field is
/// a plain tick interval used purely in-process); this newtype gives
/// the aggregate config a serializable slot without adding a serde
/// dependency to the scheduler module for one integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigOwned {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_scheduler_max_history")]
    pub max_history: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_scheduler_max_history() -> usize {
    1000
}

impl Default for SchedulerConfigOwned {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_history: default_scheduler_max_history(),
        }
    }
}

impl From<SchedulerConfigOwned> for SchedulerConfig {
    fn from(c: SchedulerConfigOwned) -> Self {
        SchedulerConfig {
            tick_interval_ms: c.tick_interval_ms,
            max_history: c.max_history,
        }
    }
}

impl Config {
    /// Small worker pools, short ticks, low dead-letter retention —
    /// fast feedback for local iteration.
    pub fn development() -> Self {
        Self {
            jobs: JobManagerConfig::development(),
            scheduler: SchedulerConfigOwned {
                tick_interval_ms: 200,
                ..Default::default()
            },
            cache: CacheConfig {
                memory_capacity: 100,
                ..Default::default()
            },
            compression: CompressionConfig::default(),
            balancer: BalancerConfig::default(),
            resources: ResourceManagerConfig {
                initial_permits: 2,
                max_permits: 4,
                ..Default::default()
            },
        }
    }

    /// Larger worker pools and dead-letter retention, tuned for a
    /// long-running deployment.
    pub fn production() -> Self {
        Self {
            jobs: JobManagerConfig::production(),
            scheduler: SchedulerConfigOwned {
                tick_interval_ms: 1000,
                ..Default::default()
            },
            cache: CacheConfig {
                memory_capacity: default_memory_cache_capacity(),
                ..Default::default()
            },
            compression: CompressionConfig::default(),
            balancer: BalancerConfig::default(),
            resources: ResourceManagerConfig {
                initial_permits: 16,
                max_permits: 128,
                ..Default::default()
            },
        }
    }
}
