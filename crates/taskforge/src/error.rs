//! Crate-wide error type
//!
//! Each subsystem (cache, jobs, scheduler, balancer) owns a local
//! `thiserror` enum; this module aggregates them behind a single
//! `Error`/`Result` pair so callers crossing subsystem boundaries don't
//! have to match on five different error types.

use std::fmt;

use crate::balancer::BalancerError;
use crate::cache::CacheError;
use crate::compression::CompressionError;
use crate::jobs::JobError;
use crate::scheduler::SchedulerError;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// Cache subsystem error.
    Cache(CacheError),

    /// Job processing error.
    Job(JobError),

    /// Scheduler error.
    Scheduler(SchedulerError),

    /// Load balancer error.
    Balancer(BalancerError),

    /// Compression/decompression error.
    Compression(CompressionError),

    /// Validation error surfaced synchronously to a caller.
    Validation(String),

    /// Admission rejected (resource budget exhausted).
    Admission(String),

    /// Generic error with description.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cache(e) => write!(f, "cache error: {}", e),
            Error::Job(e) => write!(f, "job error: {}", e),
            Error::Scheduler(e) => write!(f, "scheduler error: {}", e),
            Error::Balancer(e) => write!(f, "load balancer error: {}", e),
            Error::Compression(e) => write!(f, "compression error: {}", e),
            Error::Validation(msg) => write!(f, "validation error: {}", msg),
            Error::Admission(msg) => write!(f, "admission rejected: {}", msg),
            Error::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Cache(e) => Some(e),
            Error::Job(e) => Some(e),
            Error::Scheduler(e) => Some(e),
            Error::Balancer(e) => Some(e),
            Error::Compression(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for Error {
    fn from(e: CacheError) -> Self {
        Error::Cache(e)
    }
}

impl From<JobError> for Error {
    fn from(e: JobError) -> Self {
        Error::Job(e)
    }
}

impl From<SchedulerError> for Error {
    fn from(e: SchedulerError) -> Self {
        Error::Scheduler(e)
    }
}

impl From<BalancerError> for Error {
    fn from(e: BalancerError) -> Self {
        Error::Balancer(e)
    }
}

impl From<CompressionError> for Error {
    fn from(e: CompressionError) -> Self {
        Error::Compression(e)
    }
}

impl Error {
    /// Create a validation error.
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an admission error.
    pub fn admission<T: Into<String>>(msg: T) -> Self {
        Error::Admission(msg.into())
    }

    /// Error category, for metrics tagging: Validation / Admission /
    /// Handler / Timeout / Transport / Fatal / Other, rather than HTTP
    /// status codes, since this crate has no HTTP surface of its own.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Cache(_) => "transport",
            Error::Job(e) => e.category(),
            Error::Scheduler(_) => "validation",
            Error::Balancer(_) => "transport",
            Error::Compression(_) => "other",
            Error::Validation(_) => "validation",
            Error::Admission(_) => "admission",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(Error::validation("bad").category(), "validation");
        assert_eq!(Error::admission("full").category(), "admission");
    }

    #[test]
    fn test_display() {
        let err = Error::Other("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }
}
