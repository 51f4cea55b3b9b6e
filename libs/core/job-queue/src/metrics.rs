//! Prometheus metrics for queue workers
//!
//! Provides observability into worker throughput, retries and queue depth.

use crate::record::QueueCounts;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed the failure is logged and metrics stay
/// unrendered.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Queue worker metrics helper
#[derive(Clone)]
pub struct QueueMetrics {
    /// Queue name for labeling
    queue_name: String,
    /// Processor name for labeling
    processor_name: String,
}

impl QueueMetrics {
    pub fn new(queue_name: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            processor_name: processor_name.into(),
        }
    }

    pub fn job_claimed(&self, kind: &str) {
        counter!(
            "job_queue_jobs_claimed_total",
            "queue" => self.queue_name.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record a job completing, measured from claim to ack
    pub fn job_completed(&self, kind: &str, duration: Duration) {
        counter!(
            "job_queue_jobs_processed_total",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone(),
            "kind" => kind.to_string(),
            "status" => "completed"
        )
        .increment(1);

        histogram!(
            "job_queue_job_duration_seconds",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone(),
            "kind" => kind.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt
    pub fn job_failed(&self, kind: &str, category: &str) {
        counter!(
            "job_queue_job_errors_total",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone(),
            "kind" => kind.to_string(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn job_retried(&self, kind: &str) {
        counter!(
            "job_queue_jobs_retried_total",
            "queue" => self.queue_name.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn job_dead_lettered(&self, kind: &str) {
        counter!(
            "job_queue_jobs_processed_total",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone(),
            "kind" => kind.to_string(),
            "status" => "failed"
        )
        .increment(1);
    }

    /// A worker lost its lease before it could ack
    pub fn lease_lost(&self) {
        counter!(
            "job_queue_leases_lost_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "job_queue_in_flight_jobs",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .set(count as f64);
    }

    /// Publish a queue snapshot as gauges
    pub fn queue_depth(&self, counts: &QueueCounts) {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("active", counts.active),
            ("delayed", counts.delayed),
            ("completed", counts.completed),
            ("failed", counts.failed),
            ("expired", counts.expired),
        ] {
            gauge!(
                "job_queue_jobs",
                "queue" => self.queue_name.clone(),
                "state" => state
            )
            .set(value as f64);
        }
        gauge!("job_queue_workers", "queue" => self.queue_name.clone()).set(counts.workers as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = QueueMetrics::new("notifications", "push");
        assert_eq!(metrics.queue_name, "notifications");
        assert_eq!(metrics.processor_name, "push");
    }

    #[test]
    fn test_render_without_recorder_is_empty() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
    }
}
