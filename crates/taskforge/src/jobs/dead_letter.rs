//! Dead-letter queue for jobs that exhausted their retries

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::job::{Job, JobId};
use super::retry::RetryHistory;

/// A job that exhausted `max_attempts`, kept with enough context to
/// diagnose why.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    pub final_error: String,
    pub retry_history: RetryHistory,
    pub created_at: DateTime<Utc>,
}

/// Bounded ring buffer of dead letters. Oldest entries are evicted once
/// `max_size` is reached; this is a diagnostics aid, not a durable
/// store.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetter>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Push a dead letter, evicting the oldest entry if at capacity.
    pub fn push(&mut self, job: Job, final_error: impl Into<String>, retry_history: RetryHistory) {
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(DeadLetter {
            job,
            final_error: final_error.into(),
            retry_history,
            created_at: Utc::now(),
        });
    }

    /// Look up a dead letter by job id.
    pub fn get(&self, job_id: JobId) -> Option<&DeadLetter> {
        self.entries.iter().find(|d| d.job.id == job_id)
    }

    /// Current number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DeadLetter> {
        self.entries.iter()
    }
}
