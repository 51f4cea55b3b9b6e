//! Queue errors and the retry policy attached to them.
//!
//! Every [`QueueError`] maps to an [`ErrorCategory`]. The worker retries
//! transient and rate-limited failures with capped exponential backoff and
//! dead-letters permanent ones on the spot.

use strum::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Backoff from 1s, capped at 30s.
    Transient,
    /// No retry.
    Permanent,
    /// Downstream throttling. Backoff from 5s, capped at 2 minutes.
    RateLimited,
}

impl ErrorCategory {
    /// `(first delay, cap)` in milliseconds.
    fn backoff_bounds(self) -> (u64, u64) {
        match self {
            ErrorCategory::Transient => (1_000, 30_000),
            ErrorCategory::RateLimited => (5_000, 120_000),
            ErrorCategory::Permanent => (0, 0),
        }
    }

    /// Delay before the next attempt, given the attempts already made.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let (first, cap) = self.backoff_bounds();
        first.saturating_mul(2u64.saturating_pow(attempts)).min(cap)
    }

    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job payload could not be encoded or decoded: {0}")]
    Serialization(String),

    /// A stored job record is missing fields or has malformed values.
    #[error("Corrupt job record {job_id}: {details}")]
    CorruptRecord { job_id: String, details: String },

    /// Returned by a processor; the category decides what happens next.
    #[error("Job failed ({category}): {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    #[error("Invalid queue configuration: {0}")]
    Config(String),
}

impl QueueError {
    pub fn transient(message: impl Into<String>) -> Self {
        QueueError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        QueueError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        QueueError::Processing {
            message: message.into(),
            category: ErrorCategory::RateLimited,
        }
    }

    pub(crate) fn corrupt(job_id: impl Into<String>, details: impl Into<String>) -> Self {
        QueueError::CorruptRecord {
            job_id: job_id.into(),
            details: details.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(_) => ErrorCategory::Transient,
            QueueError::Processing { category, .. } => *category,
            QueueError::Serialization(_)
            | QueueError::CorruptRecord { .. }
            | QueueError::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether a job that has already made `attempts` attempts may run again
    /// under a budget of `max_attempts`.
    pub fn should_retry(&self, attempts: u32, max_attempts: u32) -> bool {
        self.category() != ErrorCategory::Permanent && attempts < max_attempts
    }

    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        self.category().backoff_delay_ms(attempts)
    }

    /// Lost or refused connections slow the claim loop down.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
