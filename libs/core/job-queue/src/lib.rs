//! Job Queue Framework
//!
//! A durable, priority-ordered job queue with leases and a generic worker pool.
//!
//! ## Features
//!
//! - **Priority ordering**: lower priority numbers run first, FIFO within a level
//! - **Leases**: a claimed job belongs to one worker until its lease expires
//! - **TTL**: jobs that wait past their time-to-live are expired, never run
//! - **De-duplication**: concurrent duplicates coalesce on a dedupe key
//! - **Retry & dead-letter**: exponential backoff, then the failed set
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{QueueDef, QueueWorker, RedisJobStore, WorkerConfig};
//!
//! struct PushQueue;
//! impl QueueDef for PushQueue {
//!     const QUEUE_NAME: &'static str = "notifications";
//! }
//!
//! let store = Arc::new(RedisJobStore::<PushJob>::new(redis, PushQueue::QUEUE_NAME));
//! let config = WorkerConfig::from_queue_def::<PushQueue>().with_concurrency(5);
//! let worker = QueueWorker::new(store, Arc::new(processor), config);
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
pub mod connection;
mod error;
mod health;
mod memory;
pub mod metrics;
mod record;
mod redis_store;
mod registry;
mod store;
mod worker;

pub use config::WorkerConfig;
pub use error::{ErrorCategory, QueueError};
pub use health::{HealthState, health_router};
pub use memory::InMemoryJobStore;
pub use metrics::{QueueMetrics, init_metrics};
pub use record::{Disposition, EnqueueOutcome, JobRecord, JobState, QueueCounts, waiting_score};
pub use redis_store::{QueueKeys, RedisJobStore};
pub use registry::{
    HIGHEST_PRIORITY, JobContext, JobProcessor, LOWEST_PRIORITY, QueueDef, QueueJob,
    clamp_priority,
};
pub use store::JobStore;
pub use worker::QueueWorker;
