//! Rule-driven alerting.
//!
//! [`AlertManager`] periodically evaluates its rules against a health
//! snapshot, fires alerts outside each rule's cooldown and hands them to the
//! [`AlertDispatcher`] for delivery.

mod sinks;

pub use sinks::{
    AlertDispatcher, AlertSink, DEFAULT_DISPATCH_CAPACITY, EmailSink, SmtpConfig, WebhookSink,
};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::metrics_collector::{HealthSnapshot, MetricsCollector};
use crate::models::Severity;

/// Unresolved alerts kept per rule before the oldest is auto-resolved.
pub const MAX_UNRESOLVED_PER_RULE: usize = 10;

/// How long fired alerts are kept.
pub const ALERT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Metrics a [`AlertCondition::MetricThreshold`] rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    AvgProcessingMs,
    FailedJobs,
    DelayedJobs,
    ExpiredJobs,
}

impl AlertMetric {
    fn read(&self, snapshot: &HealthSnapshot) -> Option<f64> {
        match self {
            AlertMetric::AvgProcessingMs => {
                (snapshot.sample_count > 0).then_some(snapshot.avg_processing_ms)
            }
            AlertMetric::FailedJobs => snapshot.queue.as_ref().map(|q| q.failed as f64),
            AlertMetric::DelayedJobs => snapshot.queue.as_ref().map(|q| q.delayed as f64),
            AlertMetric::ExpiredJobs => snapshot.queue.as_ref().map(|q| q.expired as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    /// Waiting jobs at or above `threshold`.
    QueueBacklog { threshold: u64 },
    /// Recent delivery error rate (0.0 to 1.0) at or above `threshold`.
    ErrorRate { threshold: f64 },
    /// No worker has a live heartbeat.
    WorkerDown,
    /// The queue store cannot be reached.
    RedisDown,
    MetricThreshold { metric: AlertMetric, threshold: f64 },
}

impl AlertCondition {
    /// Message and data when the condition holds.
    fn check(&self, snapshot: &HealthSnapshot) -> Option<(String, Value)> {
        match self {
            AlertCondition::QueueBacklog { threshold } => {
                let waiting = snapshot.queue.as_ref()?.waiting;
                (waiting >= *threshold).then(|| {
                    (
                        format!(
                            "Queue backlog at {} waiting jobs (threshold {})",
                            waiting, threshold
                        ),
                        json!({ "waiting": waiting, "threshold": threshold }),
                    )
                })
            }
            AlertCondition::ErrorRate { threshold } => {
                let rate = snapshot.error_rate;
                (snapshot.sample_count > 0 && rate >= *threshold).then(|| {
                    (
                        format!(
                            "Delivery error rate at {:.1}% (threshold {:.1}%)",
                            rate * 100.0,
                            threshold * 100.0
                        ),
                        json!({ "error_rate": rate, "threshold": threshold }),
                    )
                })
            }
            AlertCondition::WorkerDown => {
                let queue = snapshot.queue.as_ref()?;
                (queue.workers == 0).then(|| {
                    (
                        "No notification workers are running".to_string(),
                        json!({ "waiting": queue.waiting, "workers": 0 }),
                    )
                })
            }
            AlertCondition::RedisDown => snapshot.queue.is_none().then(|| {
                ("Queue store is unreachable".to_string(), json!({}))
            }),
            AlertCondition::MetricThreshold { metric, threshold } => {
                let value = metric.read(snapshot)?;
                (value >= *threshold).then(|| {
                    (
                        format!("{} at {:.0} (threshold {:.0})", metric, value, threshold),
                        json!({ "metric": metric, "value": value, "threshold": threshold }),
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: AlertCondition,
    pub severity: Severity,
    pub cooldown_minutes: u32,
    pub enabled: bool,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: AlertCondition,
        severity: Severity,
        cooldown_minutes: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            severity,
            cooldown_minutes,
            enabled: true,
            last_triggered: None,
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_triggered
            .is_some_and(|at| now - at < chrono::Duration::minutes(self.cooldown_minutes.into()))
    }
}

/// Partial update for [`AlertManager::update_rule`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRuleUpdate {
    pub name: Option<String>,
    pub condition: Option<AlertCondition>,
    pub severity: Option<Severity>,
    pub cooldown_minutes: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// The rules every manager starts with.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "queue_backlog_warning",
            "Queue backlog warning",
            AlertCondition::QueueBacklog { threshold: 50 },
            Severity::Warning,
            15,
        ),
        AlertRule::new(
            "queue_backlog_critical",
            "Queue backlog critical",
            AlertCondition::QueueBacklog { threshold: 100 },
            Severity::Critical,
            10,
        ),
        AlertRule::new(
            "error_rate_warning",
            "Delivery error rate warning",
            AlertCondition::ErrorRate { threshold: 0.10 },
            Severity::Warning,
            15,
        ),
        AlertRule::new(
            "error_rate_critical",
            "Delivery error rate critical",
            AlertCondition::ErrorRate { threshold: 0.20 },
            Severity::Critical,
            10,
        ),
        AlertRule::new(
            "worker_down",
            "No workers running",
            AlertCondition::WorkerDown,
            Severity::Critical,
            5,
        ),
        AlertRule::new(
            "redis_down",
            "Queue store unreachable",
            AlertCondition::RedisDown,
            Severity::Critical,
            5,
        ),
        AlertRule::new(
            "slow_processing",
            "Slow job processing",
            AlertCondition::MetricThreshold {
                metric: AlertMetric::AvgProcessingMs,
                threshold: 30_000.0,
            },
            Severity::Warning,
            30,
        ),
    ]
}

/// Evaluates alert rules and keeps the alert history.
pub struct AlertManager {
    collector: Arc<MetricsCollector>,
    dispatcher: Option<AlertDispatcher>,
    rules: RwLock<Vec<AlertRule>>,
    alerts: RwLock<Vec<Alert>>,
}

impl AlertManager {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            dispatcher: None,
            rules: RwLock::new(default_rules()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Evaluate every enabled rule once. Returns the alerts fired.
    pub async fn evaluate(&self) -> Vec<Alert> {
        let snapshot = self.collector.snapshot().await;
        self.evaluate_snapshot(&snapshot, Utc::now()).await
    }

    async fn evaluate_snapshot(
        &self,
        snapshot: &HealthSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut fired = Vec::new();
        {
            let mut rules = self.rules.write().await;
            for rule in rules.iter_mut().filter(|r| r.enabled) {
                let Some((message, data)) = rule.condition.check(snapshot) else {
                    continue;
                };
                if rule.in_cooldown(now) {
                    debug!(rule_id = %rule.id, "Alert condition holds but rule is cooling down");
                    continue;
                }
                rule.last_triggered = Some(now);
                fired.push(Alert {
                    id: Uuid::now_v7(),
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    message,
                    data,
                    timestamp: now,
                    resolved: false,
                    resolved_at: None,
                });
            }
        }

        {
            let mut alerts = self.alerts.write().await;
            let retention =
                chrono::Duration::from_std(ALERT_RETENTION).unwrap_or(chrono::Duration::days(1));
            alerts.retain(|a| now - a.timestamp < retention);

            for alert in &fired {
                warn!(
                    rule_id = %alert.rule_id,
                    severity = %alert.severity,
                    message = %alert.message,
                    "Alert fired"
                );
                counter!(
                    "notifications_alerts_fired_total",
                    "rule" => alert.rule_id.clone(),
                    "severity" => alert.severity.to_string()
                )
                .increment(1);

                alerts.push(alert.clone());
                cap_unresolved(&mut alerts, &alert.rule_id, now);
            }
        }

        if let Some(dispatcher) = &self.dispatcher {
            for alert in &fired {
                dispatcher.dispatch(alert.clone());
            }
        }
        fired
    }

    /// Evaluate every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Alert manager started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fired = self.evaluate().await;
                    debug!(fired = fired.len(), "Alert rules evaluated");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Alert manager stopped");
    }

    pub async fn add_rule(&self, rule: AlertRule) -> NotificationResult<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(NotificationError::DuplicateRule(rule.id));
        }
        info!(rule_id = %rule.id, "Alert rule added");
        rules.push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    /// Apply `update` to a rule. Returns the updated rule, or `None` if it
    /// does not exist.
    pub async fn update_rule(&self, rule_id: &str, update: AlertRuleUpdate) -> Option<AlertRule> {
        let mut rules = self.rules.write().await;
        let rule = rules.iter_mut().find(|r| r.id == rule_id)?;
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(condition) = update.condition {
            rule.condition = condition;
        }
        if let Some(severity) = update.severity {
            rule.severity = severity;
        }
        if let Some(cooldown) = update.cooldown_minutes {
            rule.cooldown_minutes = cooldown;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        Some(rule.clone())
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    /// Unresolved alerts, newest first.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().rev().filter(|a| !a.resolved).cloned().collect()
    }

    pub async fn resolve_alert(&self, alert_id: Uuid) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == alert_id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Drop the whole history. Returns how many alerts were removed.
    pub async fn clear_alerts(&self) -> usize {
        let mut alerts = self.alerts.write().await;
        let cleared = alerts.len();
        alerts.clear();
        info!(cleared, "Alerts cleared");
        cleared
    }
}

fn cap_unresolved(alerts: &mut [Alert], rule_id: &str, now: DateTime<Utc>) {
    let unresolved = alerts
        .iter()
        .filter(|a| a.rule_id == rule_id && !a.resolved)
        .count();
    let excess = unresolved.saturating_sub(MAX_UNRESOLVED_PER_RULE);
    for alert in alerts
        .iter_mut()
        .filter(|a| a.rule_id == rule_id && !a.resolved)
        .take(excess)
    {
        alert.resolved = true;
        alert.resolved_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationJob;
    use crate::subscriptions::InMemorySubscriptionStore;
    use job_queue::{InMemoryJobStore, QueueCounts};

    fn manager() -> AlertManager {
        let collector = MetricsCollector::new(
            Arc::new(InMemoryJobStore::<NotificationJob>::new()),
            Arc::new(InMemorySubscriptionStore::new()),
        );
        AlertManager::new(Arc::new(collector))
    }

    fn snapshot(waiting: u64, workers: u64) -> HealthSnapshot {
        HealthSnapshot {
            queue: Some(QueueCounts {
                waiting,
                active: 1,
                workers,
                ..Default::default()
            }),
            subscriptions_reachable: true,
            ..Default::default()
        }
    }

    fn rule_ids(alerts: &[Alert]) -> Vec<&str> {
        let mut ids: Vec<_> = alerts.iter().map(|a| a.rule_id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_default_rules() {
        let rules = default_rules();
        assert_eq!(rules.len(), 7);
        assert!(rules.iter().all(|r| r.enabled));
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"worker_down"));
        assert!(ids.contains(&"slow_processing"));
    }

    #[tokio::test]
    async fn test_backlog_fires_both_levels_then_cools_down() {
        let manager = manager();
        let now = Utc::now();

        let fired = manager.evaluate_snapshot(&snapshot(150, 1), now).await;
        assert_eq!(
            rule_ids(&fired),
            vec!["queue_backlog_critical", "queue_backlog_warning"]
        );

        let again = manager
            .evaluate_snapshot(&snapshot(150, 1), now + chrono::Duration::minutes(5))
            .await;
        assert!(again.is_empty());

        let later = manager
            .evaluate_snapshot(&snapshot(150, 1), now + chrono::Duration::minutes(11))
            .await;
        assert_eq!(rule_ids(&later), vec!["queue_backlog_critical"]);
        assert_eq!(manager.active_alerts().await.len(), 3);
    }

    #[tokio::test]
    async fn test_redis_down_and_worker_down() {
        let manager = manager();
        let now = Utc::now();

        let fired = manager.evaluate_snapshot(&HealthSnapshot::default(), now).await;
        assert_eq!(rule_ids(&fired), vec!["redis_down"]);

        let fired = manager.evaluate_snapshot(&snapshot(0, 0), now).await;
        assert_eq!(rule_ids(&fired), vec!["worker_down"]);
    }

    #[tokio::test]
    async fn test_error_rate_and_slow_processing() {
        let manager = manager();
        let snapshot = HealthSnapshot {
            error_rate: 0.15,
            avg_processing_ms: 31_000.0,
            sample_count: 4,
            ..snapshot(0, 1)
        };
        let fired = manager.evaluate_snapshot(&snapshot, Utc::now()).await;
        assert_eq!(rule_ids(&fired), vec!["error_rate_warning", "slow_processing"]);
    }

    #[tokio::test]
    async fn test_rule_management() {
        let manager = manager();
        let rule = AlertRule::new(
            "failed_jobs",
            "Dead-lettered jobs",
            AlertCondition::MetricThreshold {
                metric: AlertMetric::FailedJobs,
                threshold: 5.0,
            },
            Severity::Warning,
            60,
        );
        manager.add_rule(rule.clone()).await.unwrap();
        assert!(matches!(
            manager.add_rule(rule).await,
            Err(NotificationError::DuplicateRule(_))
        ));

        let updated = manager
            .update_rule(
                "failed_jobs",
                AlertRuleUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert!(manager.update_rule("missing", AlertRuleUpdate::default()).await.is_none());

        assert!(manager.remove_rule("failed_jobs").await);
        assert!(!manager.remove_rule("failed_jobs").await);
        assert_eq!(manager.rules().await.len(), 7);
    }

    #[tokio::test]
    async fn test_unresolved_alerts_capped_per_rule() {
        let manager = manager();
        manager
            .update_rule(
                "redis_down",
                AlertRuleUpdate {
                    cooldown_minutes: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let start = Utc::now();
        for i in 0..(MAX_UNRESOLVED_PER_RULE + 3) {
            manager
                .evaluate_snapshot(
                    &HealthSnapshot::default(),
                    start + chrono::Duration::seconds(i as i64),
                )
                .await;
        }

        let active = manager.active_alerts().await;
        assert_eq!(active.len(), MAX_UNRESOLVED_PER_RULE);

        assert!(manager.resolve_alert(active[0].id).await);
        assert!(!manager.resolve_alert(active[0].id).await);
        assert_eq!(manager.active_alerts().await.len(), MAX_UNRESOLVED_PER_RULE - 1);

        assert_eq!(manager.clear_alerts().await, MAX_UNRESOLVED_PER_RULE + 3);
        assert!(manager.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_old_alerts_are_pruned() {
        let manager = manager();
        let start = Utc::now();
        manager.evaluate_snapshot(&HealthSnapshot::default(), start).await;

        manager
            .evaluate_snapshot(&snapshot(0, 1), start + chrono::Duration::hours(25))
            .await;
        assert!(manager.active_alerts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let manager = Arc::new(manager());
        let (tx, rx) = watch::channel(false);
        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(Duration::from_secs(60), rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // First tick fires immediately; the in-memory store has no workers.
        assert_eq!(rule_ids(&manager.active_alerts().await), vec!["worker_down"]);
    }
}
