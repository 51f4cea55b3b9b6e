//! The job store abstraction shared by producers, workers and admin tooling.

use crate::error::QueueError;
use crate::record::{EnqueueOutcome, JobRecord, QueueCounts};
use crate::registry::QueueJob;
use async_trait::async_trait;
use std::time::Duration;

/// Durable, priority-ordered job store with leases, TTL and de-duplication.
///
/// Implementations must make `claim` atomic: a job is leased to at most one
/// worker at a time, and a lease that is not renewed expires so the job can
/// be reclaimed. `complete`, `retry`, `fail` and `extend_lease` only apply
/// while the caller still owns the lease and return `false` otherwise.
#[async_trait]
pub trait JobStore<J: QueueJob>: Send + Sync {
    /// Store a job, or coalesce it with a live job sharing its dedupe key.
    async fn enqueue(&self, job: J) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the most urgent claimable job to `worker_id`.
    ///
    /// Promotes due delayed jobs, reclaims expired leases and moves expired
    /// jobs aside before choosing. Returns `None` when the queue is paused
    /// or empty.
    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord<J>>, QueueError>;

    async fn extend_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError>;

    async fn complete(&self, job_id: &str, worker_id: &str) -> Result<bool, QueueError>;

    /// Schedule another attempt after `delay`, persisting the updated payload.
    async fn retry(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        delay: Duration,
        error: &str,
    ) -> Result<bool, QueueError>;

    /// Dead-letter the job.
    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        error: &str,
    ) -> Result<bool, QueueError>;

    /// Remove a job that has not started yet.
    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord<J>>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Move up to `limit` dead-lettered jobs back to waiting with a fresh
    /// attempt budget.
    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError>;

    /// Delete finished jobs older than `older_than`.
    async fn clean(&self, older_than: Duration) -> Result<usize, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> Result<bool, QueueError>;

    /// Record that `worker_id` is alive for the next `ttl`.
    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError>;

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), QueueError>;

    async fn active_workers(&self) -> Result<u64, QueueError>;

    /// Backend connectivity check.
    async fn ping(&self) -> Result<(), QueueError>;
}
