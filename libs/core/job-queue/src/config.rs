//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the queue worker pool.

use crate::registry::QueueDef;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for the queue worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue name (Redis key prefix)
    pub queue_name: String,

    /// Unique worker ID (auto-generated if not provided)
    pub worker_id: String,

    /// Number of concurrent consumers
    pub concurrency: usize,

    /// Poll interval in milliseconds when no job is available
    pub poll_interval_ms: u64,

    /// Lease duration in milliseconds; renewed while a job runs
    pub lease_ms: u64,

    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,

    /// How long in-flight jobs may run after shutdown is requested
    pub shutdown_grace_ms: u64,

    /// Interval between worker heartbeats
    pub heartbeat_interval_ms: u64,
}

impl WorkerConfig {
    /// Create a new WorkerConfig from a QueueDef
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self {
            queue_name: Q::QUEUE_NAME.to_string(),
            lease_ms: Q::LEASE_MS,
            max_attempts: Q::MAX_ATTEMPTS,
            poll_interval_ms: Q::POLL_INTERVAL_MS,
            ..Self::new(Q::QUEUE_NAME)
        }
    }

    /// Create a new WorkerConfig with explicit values
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 5,
            poll_interval_ms: 500,
            lease_ms: 60_000,
            max_attempts: 3,
            shutdown_grace_ms: 30_000,
            heartbeat_interval_ms: 10_000,
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of concurrent consumers
    pub fn with_concurrency(mut self, count: usize) -> Self {
        self.concurrency = count.max(1);
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Set the lease duration
    pub fn with_lease_ms(mut self, lease: u64) -> Self {
        self.lease_ms = lease.max(1);
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace_ms(mut self, grace: u64) -> Self {
        self.shutdown_grace_ms = grace;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval_ms(mut self, interval: u64) -> Self {
        self.heartbeat_interval_ms = interval.max(1);
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Leases are renewed three times per lease period.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis((self.lease_ms / 3).max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// A worker is considered gone after missing three heartbeats.
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * 3)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestQueue;

    impl QueueDef for TestQueue {
        const QUEUE_NAME: &'static str = "test:queue";
        const LEASE_MS: u64 = 9_000;
        const MAX_ATTEMPTS: u32 = 4;
    }

    #[test]
    fn test_from_queue_def() {
        let config = WorkerConfig::from_queue_def::<TestQueue>();

        assert_eq!(config.queue_name, "test:queue");
        assert_eq!(config.lease_ms, 9_000);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.concurrency, 5);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("push")
            .with_worker_id("worker-1")
            .with_concurrency(0)
            .with_lease_ms(3_000)
            .with_max_attempts(2)
            .with_shutdown_grace_ms(1_000);

        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.lease_renew_interval(), Duration::from_millis(1_000));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(1));
    }
}
