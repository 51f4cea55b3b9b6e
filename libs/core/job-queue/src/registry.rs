//! Queue definitions, job payload and processor traits.
//!
//! This module provides:
//! - `QueueDef` trait for domain-specific queue definitions
//! - `QueueJob` trait for job payloads
//! - `JobProcessor` trait for the domain handler driven by `QueueWorker`
//! - `JobContext` handed to the processor with every claimed job

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

/// Highest priority a job can carry. Lower numbers run first.
pub const HIGHEST_PRIORITY: u8 = 1;

/// Lowest priority a job can carry.
pub const LOWEST_PRIORITY: u8 = 5;

/// Clamp a priority into the supported `1..=5` range.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY)
}

/// Queue definition trait.
///
/// Each domain implements this trait to name its queue and pick defaults.
///
/// # Example
///
/// ```rust,ignore
/// use job_queue::QueueDef;
///
/// pub struct PushQueue;
///
/// impl QueueDef for PushQueue {
///     const QUEUE_NAME: &'static str = "notifications";
/// }
/// ```
pub trait QueueDef: Send + Sync {
    /// Key prefix for every Redis key owned by this queue.
    const QUEUE_NAME: &'static str;

    /// How long a claim is valid before another worker may take the job over.
    const LEASE_MS: u64 = 60_000;

    /// Attempts before a job is dead-lettered.
    const MAX_ATTEMPTS: u32 = 3;

    /// Idle poll interval when the queue is empty.
    const POLL_INTERVAL_MS: u64 = 500;

    /// Get the queue name.
    fn queue_name() -> &'static str {
        Self::QUEUE_NAME
    }
}

/// Trait for queue job payloads.
///
/// The queue stores the payload opaquely; these methods supply the metadata
/// it needs at enqueue time.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Short job kind label for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Priority in `1..=5`, 1 being the most urgent.
    fn priority(&self) -> u8;

    /// How long the job stays deliverable after enqueue.
    fn ttl(&self) -> Duration;

    /// Key under which concurrent duplicates are coalesced.
    ///
    /// `enqueued_at` lets time-bucketed keys be derived.
    fn dedupe_key(&self, _enqueued_at: DateTime<Utc>) -> Option<String> {
        None
    }

    /// Whether the dedupe key stays reserved after the job completes
    /// (until its TTL), preventing a second run of an identical job.
    fn keep_dedupe_after_completion(&self) -> bool {
        false
    }
}

/// Per-claim information passed to the processor.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
    pub worker_id: String,
}

impl JobContext {
    /// True when a failure of this run dead-letters the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Trait for job processors.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl JobProcessor<PushJob> for PushProcessor {
///     async fn process(&self, job: &mut PushJob, ctx: &JobContext) -> Result<(), QueueError> {
///         self.deliver(job).await
///     }
///
///     fn name(&self) -> &'static str {
///         "PushProcessor"
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor<J: QueueJob>: Send + Sync {
    /// Process a single job.
    ///
    /// The job is mutable so progress made during a failed attempt is
    /// persisted with the retry. Return `Err` to retry or dead-letter.
    async fn process(&self, job: &mut J, ctx: &JobContext) -> Result<(), QueueError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;

    /// Health check for the processor. Default: always healthy.
    async fn health_check(&self) -> Result<bool, QueueError> {
        Ok(true)
    }
}
