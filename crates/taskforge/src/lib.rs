//! Background execution substrate: a priority job queue, worker pool
//! supervisor, cron scheduler, admission-controlled resource manager,
//! layered cache and load balancer, assembled so a host process can
//! submit units of work and forget about how they get dispatched.

pub mod balancer;
pub mod cache;
pub mod compression;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod resource;
pub mod scheduler;

pub use config::Config;
pub use error::{Error, Result};

/// Crate version, exposed for diagnostics/health endpoints a host
/// process may want to report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
