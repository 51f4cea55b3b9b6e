//! Job performance samples, windowed aggregates and the health verdict.
//!
//! Samples live in a per-process ring buffer, so aggregates describe what
//! this worker processed rather than the whole fleet.

use chrono::{DateTime, Utc};
use job_queue::{JobStore, QueueCounts};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use strum::Display;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::NotificationResult;
use crate::models::{NotificationJob, PerformanceSample, SubscriptionCounts};
use crate::subscriptions::SubscriptionStore;

/// Ring buffer capacity.
pub const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricsPeriod {
    #[default]
    Hour,
    Day,
    Week,
    Month,
}

impl MetricsPeriod {
    pub fn duration(&self) -> chrono::Duration {
        match self {
            MetricsPeriod::Hour => chrono::Duration::hours(1),
            MetricsPeriod::Day => chrono::Duration::days(1),
            MetricsPeriod::Week => chrono::Duration::weeks(1),
            MetricsPeriod::Month => chrono::Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimes {
    pub min_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub total_ms: u64,
}

/// Aggregates over one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMetrics {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_jobs: u64,
    pub jobs_by_kind: BTreeMap<String, u64>,
    pub total_targets: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    /// Sent over attempted deliveries; 1.0 when nothing was attempted.
    pub success_rate: f64,
    pub processing_times: ProcessingTimes,
    pub subscriptions: SubscriptionCounts,
    /// `None` when the queue store could not be reached.
    pub queue: Option<QueueCounts>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }
}

/// Overall verdict plus the signals behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    /// One entry per crossed threshold.
    pub alerts: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Inputs to [`evaluate_health`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    /// `None` when the queue store is unreachable.
    pub queue: Option<QueueCounts>,
    /// Failed over attempted deliveries in the lookback window.
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub sample_count: usize,
    pub subscriptions_reachable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub backlog_warning: u64,
    pub backlog_critical: u64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub slow_processing_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            backlog_warning: 50,
            backlog_critical: 100,
            error_rate_warning: 0.10,
            error_rate_critical: 0.20,
            slow_processing_ms: 30_000.0,
        }
    }
}

/// Compute the health verdict. The worst signal wins.
pub fn evaluate_health(snapshot: &HealthSnapshot, thresholds: &HealthThresholds) -> SystemHealth {
    let mut components = Vec::new();
    let mut alerts = Vec::new();

    let mut flag = |component: &mut ComponentHealth, status: HealthStatus, message: String| {
        if status > component.status {
            component.status = status;
        }
        component.message = Some(message.clone());
        alerts.push(message);
    };

    let mut queue = ComponentHealth::healthy("queue");
    let mut workers = ComponentHealth::healthy("workers");
    match &snapshot.queue {
        None => flag(&mut queue, HealthStatus::Critical, "Queue store unreachable".to_string()),
        Some(counts) => {
            if counts.waiting >= thresholds.backlog_critical {
                flag(
                    &mut queue,
                    HealthStatus::Critical,
                    format!("Critical queue backlog: {} waiting jobs", counts.waiting),
                );
            } else if counts.waiting >= thresholds.backlog_warning {
                flag(
                    &mut queue,
                    HealthStatus::Warning,
                    format!("High queue backlog: {} waiting jobs", counts.waiting),
                );
            }
            if counts.active == 0 && counts.waiting > 0 {
                flag(
                    &mut workers,
                    HealthStatus::Warning,
                    format!("No active workers with {} waiting jobs", counts.waiting),
                );
            }
        }
    }

    let mut deliveries = ComponentHealth::healthy("deliveries");
    let rate_pct = snapshot.error_rate * 100.0;
    if snapshot.error_rate >= thresholds.error_rate_critical {
        flag(
            &mut deliveries,
            HealthStatus::Critical,
            format!("Critical delivery error rate: {:.1}%", rate_pct),
        );
    } else if snapshot.error_rate >= thresholds.error_rate_warning {
        flag(
            &mut deliveries,
            HealthStatus::Warning,
            format!("High delivery error rate: {:.1}%", rate_pct),
        );
    }

    let mut processing = ComponentHealth::healthy("processing");
    if snapshot.sample_count > 0 && snapshot.avg_processing_ms >= thresholds.slow_processing_ms {
        flag(
            &mut processing,
            HealthStatus::Warning,
            format!("Slow processing: average {:.0}ms", snapshot.avg_processing_ms),
        );
    }

    let mut subscriptions = ComponentHealth::healthy("subscriptions");
    if !snapshot.subscriptions_reachable {
        flag(
            &mut subscriptions,
            HealthStatus::Critical,
            "Subscription store unreachable".to_string(),
        );
    }

    components.extend([queue, workers, deliveries, processing, subscriptions]);
    let overall = components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or_default();

    SystemHealth {
        overall,
        components,
        alerts,
        checked_at: Utc::now(),
    }
}

/// Per-process performance samples plus queue and subscription lookups.
pub struct MetricsCollector {
    store: Arc<dyn JobStore<NotificationJob>>,
    subscriptions: Arc<dyn SubscriptionStore>,
    samples: RwLock<VecDeque<PerformanceSample>>,
    thresholds: HealthThresholds,
}

impl MetricsCollector {
    pub fn new(
        store: Arc<dyn JobStore<NotificationJob>>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            samples: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub async fn record_job_performance(&self, sample: PerformanceSample) {
        let kind = sample.kind.to_string();
        histogram!("notifications_job_processing_seconds", "kind" => kind.clone())
            .record(sample.processing_time_ms as f64 / 1000.0);
        counter!("notifications_deliveries_total", "kind" => kind.clone(), "result" => "sent")
            .increment(sample.sent_count as u64);
        counter!("notifications_deliveries_total", "kind" => kind, "result" => "failed")
            .increment(sample.failed_count as u64);

        let mut samples = self.samples.write().await;
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    async fn samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<PerformanceSample> {
        self.samples
            .read()
            .await
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    async fn queue_counts(&self) -> Option<QueueCounts> {
        match self.store.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "Failed to read queue counts");
                None
            }
        }
    }

    pub async fn collect_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> NotificationResult<NotificationMetrics> {
        let samples = self.samples_between(start, end).await;
        let subscriptions = self.subscriptions.counts().await?;
        let queue = self.queue_counts().await;

        let mut jobs_by_kind = BTreeMap::new();
        let mut times = ProcessingTimes::default();
        let (mut targets, mut sent, mut failed) = (0u64, 0u64, 0u64);
        for sample in &samples {
            *jobs_by_kind.entry(sample.kind.to_string()).or_insert(0) += 1;
            targets += sample.target_count as u64;
            sent += sample.sent_count as u64;
            failed += sample.failed_count as u64;
            times.total_ms += sample.processing_time_ms;
            times.max_ms = times.max_ms.max(sample.processing_time_ms);
        }
        if !samples.is_empty() {
            times.min_ms = samples.iter().map(|s| s.processing_time_ms).min().unwrap_or(0);
            times.avg_ms = times.total_ms as f64 / samples.len() as f64;
        }

        let attempted = sent + failed;
        Ok(NotificationMetrics {
            period_start: start,
            period_end: end,
            total_jobs: samples.len() as u64,
            jobs_by_kind,
            total_targets: targets,
            total_sent: sent,
            total_failed: failed,
            success_rate: if attempted == 0 {
                1.0
            } else {
                sent as f64 / attempted as f64
            },
            processing_times: times,
            subscriptions,
            queue,
        })
    }

    pub async fn collect_for_period(
        &self,
        period: MetricsPeriod,
    ) -> NotificationResult<NotificationMetrics> {
        let end = Utc::now();
        self.collect_metrics(end - period.duration(), end).await
    }

    /// Gather the inputs of the health verdict. Never fails: unreachable
    /// stores become signals in the snapshot.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let end = Utc::now();
        let samples = self
            .samples_between(end - MetricsPeriod::Hour.duration(), end)
            .await;

        let sent: usize = samples.iter().map(|s| s.sent_count).sum();
        let failed: usize = samples.iter().map(|s| s.failed_count).sum();
        let attempted = sent + failed;
        let total_ms: u64 = samples.iter().map(|s| s.processing_time_ms).sum();

        HealthSnapshot {
            queue: self.queue_counts().await,
            error_rate: if attempted == 0 {
                0.0
            } else {
                failed as f64 / attempted as f64
            },
            avg_processing_ms: if samples.is_empty() {
                0.0
            } else {
                total_ms as f64 / samples.len() as f64
            },
            sample_count: samples.len(),
            subscriptions_reachable: self.subscriptions.counts().await.is_ok(),
        }
    }

    pub async fn system_health(&self) -> SystemHealth {
        evaluate_health(&self.snapshot().await, &self.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use crate::subscriptions::InMemorySubscriptionStore;
    use job_queue::InMemoryJobStore;
    use uuid::Uuid;

    fn counts(waiting: u64, active: u64, failed: u64) -> QueueCounts {
        QueueCounts {
            waiting,
            active,
            failed,
            workers: 1,
            ..Default::default()
        }
    }

    fn snapshot(queue: QueueCounts) -> HealthSnapshot {
        HealthSnapshot {
            queue: Some(queue),
            subscriptions_reachable: true,
            ..Default::default()
        }
    }

    fn sample(sent: usize, failed: usize, ms: u64) -> PerformanceSample {
        PerformanceSample {
            job_id: Uuid::now_v7().to_string(),
            event_id: Uuid::now_v7(),
            kind: JobKind::EventUpdate,
            processing_time_ms: ms,
            target_count: sent + failed,
            sent_count: sent,
            failed_count: failed,
            timestamp: Utc::now(),
        }
    }

    fn collector() -> MetricsCollector {
        MetricsCollector::new(
            Arc::new(InMemoryJobStore::<NotificationJob>::new()),
            Arc::new(InMemorySubscriptionStore::new()),
        )
    }

    #[test]
    fn test_backlog_is_critical() {
        let health = evaluate_health(&snapshot(counts(120, 1, 2)), &HealthThresholds::default());
        assert_eq!(health.overall, HealthStatus::Critical);
        assert_eq!(health.alerts, vec!["Critical queue backlog: 120 waiting jobs".to_string()]);
    }

    #[test]
    fn test_no_active_workers_is_warning() {
        let health = evaluate_health(&snapshot(counts(10, 0, 0)), &HealthThresholds::default());
        assert_eq!(health.overall, HealthStatus::Warning);
        assert_eq!(health.alerts, vec!["No active workers with 10 waiting jobs".to_string()]);
    }

    #[test]
    fn test_quiet_queue_is_healthy() {
        let health = evaluate_health(&snapshot(counts(0, 0, 0)), &HealthThresholds::default());
        assert_eq!(health.overall, HealthStatus::Healthy);
        assert!(health.alerts.is_empty());
    }

    #[test]
    fn test_worst_signal_wins() {
        let snapshot = HealthSnapshot {
            error_rate: 0.25,
            avg_processing_ms: 45_000.0,
            sample_count: 3,
            ..snapshot(counts(60, 2, 0))
        };
        let health = evaluate_health(&snapshot, &HealthThresholds::default());
        assert_eq!(health.overall, HealthStatus::Critical);
        assert_eq!(health.alerts.len(), 3);
    }

    #[test]
    fn test_unreachable_stores_are_critical() {
        let health = evaluate_health(&HealthSnapshot::default(), &HealthThresholds::default());
        assert_eq!(health.overall, HealthStatus::Critical);
        assert!(health.alerts.contains(&"Queue store unreachable".to_string()));
        assert!(health.alerts.contains(&"Subscription store unreachable".to_string()));
    }

    #[tokio::test]
    async fn test_ring_buffer_is_capped() {
        let collector = collector();
        for _ in 0..(MAX_SAMPLES + 5) {
            collector.record_job_performance(sample(1, 0, 10)).await;
        }
        assert_eq!(collector.sample_count().await, MAX_SAMPLES);
    }

    #[tokio::test]
    async fn test_collect_metrics_aggregates() {
        let collector = collector();
        collector.record_job_performance(sample(8, 2, 100)).await;
        collector.record_job_performance(sample(10, 0, 300)).await;

        let metrics = collector.collect_for_period(MetricsPeriod::Hour).await.unwrap();
        assert_eq!(metrics.total_jobs, 2);
        assert_eq!(metrics.total_sent, 18);
        assert_eq!(metrics.total_failed, 2);
        assert!((metrics.success_rate - 0.9).abs() < f64::EPSILON);
        assert_eq!(metrics.processing_times.min_ms, 100);
        assert_eq!(metrics.processing_times.max_ms, 300);
        assert!((metrics.processing_times.avg_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.jobs_by_kind.get("event_update"), Some(&2));
        assert_eq!(metrics.queue, Some(QueueCounts::default()));
    }

    #[tokio::test]
    async fn test_system_health_uses_recent_error_rate() {
        let collector = collector();
        collector.record_job_performance(sample(7, 3, 50)).await;

        let health = collector.system_health().await;
        assert_eq!(health.overall, HealthStatus::Critical);
        assert_eq!(health.alerts, vec!["Critical delivery error rate: 30.0%".to_string()]);
    }

    #[test]
    fn test_period_parses_lowercase() {
        let period: MetricsPeriod = serde_json::from_str("\"week\"").unwrap();
        assert_eq!(period, MetricsPeriod::Week);
        assert_eq!(period.duration(), chrono::Duration::days(7));
    }
}
