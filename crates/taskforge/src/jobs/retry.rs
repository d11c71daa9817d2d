//! Retry policies and per-job retry history

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy used to compute the delay before the next attempt.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// No retries; a single failed attempt is terminal.
    None,

    /// Fixed delay between attempts.
    Fixed {
        delay: Duration,
        max_attempts: u32,
    },

    /// Exponential backoff with jitter.
    Exponential(ExponentialBackoff),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential(ExponentialBackoff::default())
    }
}

impl RetryPolicy {
    /// Compute the delay before the attempt numbered `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { delay, .. } => *delay,
            RetryPolicy::Exponential(backoff) => backoff.calculate_delay(attempt),
        }
    }

    /// Maximum attempts allowed by this policy, if bounded.
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            RetryPolicy::None => Some(1),
            RetryPolicy::Fixed { max_attempts, .. } => Some(*max_attempts),
            RetryPolicy::Exponential(backoff) => Some(backoff.max_attempts),
        }
    }
}

/// Exponential backoff with multiplicative growth and uniform jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on the computed delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    pub multiplier: f64,

    /// Fraction of the computed delay randomized, in `[0, 1]`.
    pub jitter: f64,

    /// Attempts permitted before giving up.
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl ExponentialBackoff {
    /// Delay before the attempt numbered `attempt` (1-based: `attempt == 1`
    /// is the first retry, after the initial failed attempt).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jitter_span = capped * self.jitter;
        let jitter_offset = if jitter_span > 0.0 {
            rand::random::<f64>() * jitter_span - (jitter_span / 2.0)
        } else {
            0.0
        };

        let final_secs = (capped + jitter_offset).max(0.0);
        Duration::from_secs_f64(final_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A single retry attempt's outcome, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Attempt number, 1-based.
    pub attempt: u32,

    /// Error message from this attempt.
    pub error: String,

    /// Delay applied before the *next* attempt, if any.
    #[serde(with = "duration_millis")]
    pub delay_before_next: Duration,
}

/// Full retry history for a single job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryHistory {
    pub attempts: Vec<RetryAttempt>,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt's failure and the delay before the next try.
    pub fn record(&mut self, attempt: u32, error: impl Into<String>, delay_before_next: Duration) {
        self.attempts.push(RetryAttempt {
            attempt,
            error: error.into(),
            delay_before_next,
        });
    }

    /// The most recent recorded error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let backoff = ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(400));
        // far enough out that it should be capped
        assert_eq!(backoff.calculate_delay(20), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_history_records_in_order() {
        let mut history = RetryHistory::new();
        history.record(1, "timeout", Duration::from_millis(500));
        history.record(2, "connection refused", Duration::from_millis(1000));
        assert_eq!(history.attempts.len(), 2);
        assert_eq!(history.last_error(), Some("connection refused"));
    }

    #[test]
    fn test_none_policy_forbids_retry() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_attempts(), Some(1));
    }
}
