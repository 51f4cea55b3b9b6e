//! Delivery failure tracking.
//!
//! Every failed send passes through [`ErrorTracker::track_error`], which
//! classifies it, keeps rolling statistics and a capped log, cleans up
//! endpoints the push service reports as gone, and raises alerts when
//! failure levels cross thresholds.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NotificationResult;
use crate::models::Severity;
use crate::subscriptions::SubscriptionStore;
use crate::transport::{DeliveryError, ErrorClass};

/// Thresholds and retention for the tracker.
#[derive(Debug, Clone)]
pub struct ErrorTrackerConfig {
    /// Errors over total subscriptions that raise a warning.
    pub warning_failure_rate: f64,
    pub critical_failure_rate: f64,
    pub invalid_endpoint_threshold: u64,
    pub server_error_threshold: u64,
    /// Minimum gap between two alerts of the same kind.
    pub alert_cooldown: Duration,
    pub max_alerts: usize,
    pub max_log_entries: usize,
    /// Statistics reset after this long.
    pub stats_window: Duration,
    pub disabled_retention_days: i64,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self {
            warning_failure_rate: 0.10,
            critical_failure_rate: 0.25,
            invalid_endpoint_threshold: 50,
            server_error_threshold: 10,
            alert_cooldown: Duration::from_secs(15 * 60),
            max_alerts: 100,
            max_log_entries: 1000,
            stats_window: Duration::from_secs(3600),
            disabled_retention_days: 7,
        }
    }
}

impl ErrorTrackerConfig {
    pub fn with_disabled_retention_days(mut self, days: i64) -> Self {
        self.disabled_retention_days = days;
        self
    }
}

/// Rolling counters for the current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_status: BTreeMap<u16, u64>,
    pub by_class: BTreeMap<ErrorClass, u64>,
    pub window_started_at: DateTime<Utc>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ErrorStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_errors: 0,
            by_status: BTreeMap::new(),
            by_class: BTreeMap::new(),
            window_started_at: now,
            last_error_at: None,
        }
    }

    pub fn count(&self, class: ErrorClass) -> u64 {
        self.by_class.get(&class).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub message: String,
    pub class: ErrorClass,
    pub job_id: Option<String>,
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorAlertKind {
    FailureRateWarning,
    FailureRateCritical,
    InvalidEndpoints,
    TransportErrors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAlert {
    pub id: Uuid,
    pub kind: ErrorAlertKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct TrackerState {
    stats: ErrorStats,
    log: VecDeque<ErrorLogEntry>,
    alerts: VecDeque<ErrorAlert>,
    last_alert: HashMap<ErrorAlertKind, DateTime<Utc>>,
}

impl TrackerState {
    fn roll_window(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        if now - self.stats.window_started_at >= window {
            debug!(
                total_errors = self.stats.total_errors,
                "Error statistics window rolled over"
            );
            self.stats = ErrorStats::new(now);
        }
    }
}

/// Classifies delivery failures and reacts to them.
pub struct ErrorTracker {
    subscriptions: Arc<dyn SubscriptionStore>,
    config: ErrorTrackerConfig,
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, config: ErrorTrackerConfig) -> Self {
        Self {
            subscriptions,
            config,
            state: Mutex::new(TrackerState {
                stats: ErrorStats::new(Utc::now()),
                log: VecDeque::new(),
                alerts: VecDeque::new(),
                last_alert: HashMap::new(),
            }),
        }
    }

    /// Record one failed delivery and apply the per-class handling.
    pub async fn track_error(
        &self,
        endpoint: &str,
        error: &DeliveryError,
        job_id: Option<&str>,
        event_id: Option<Uuid>,
    ) -> NotificationResult<ErrorClass> {
        let class = error.class();
        let now = Utc::now();

        {
            let mut state = self.state.lock().await;
            state.roll_window(now, self.config.stats_window);
            state.stats.total_errors += 1;
            if let Some(status) = error.status_code {
                *state.stats.by_status.entry(status).or_default() += 1;
            }
            *state.stats.by_class.entry(class).or_default() += 1;
            state.stats.last_error_at = Some(now);

            state.log.push_back(ErrorLogEntry {
                timestamp: now,
                endpoint: endpoint.to_string(),
                status_code: error.status_code,
                message: error.message.clone(),
                class,
                job_id: job_id.map(str::to_string),
                event_id,
            });
            while state.log.len() > self.config.max_log_entries {
                state.log.pop_front();
            }
        }

        counter!(
            "notifications_delivery_errors_total",
            "class" => class.to_string()
        )
        .increment(1);

        self.handle(class, endpoint, error).await?;
        self.check_alerts(now).await?;
        Ok(class)
    }

    async fn handle(
        &self,
        class: ErrorClass,
        endpoint: &str,
        error: &DeliveryError,
    ) -> NotificationResult<()> {
        match class {
            ErrorClass::InvalidEndpoint => {
                self.subscriptions.disable_by_endpoint(endpoint).await?;
                let deleted = self.subscriptions.delete_by_endpoint(endpoint).await?;
                info!(
                    endpoint = %endpoint,
                    status = ?error.status_code,
                    deleted,
                    "Removed invalid push endpoint"
                );
            }
            ErrorClass::PayloadTooLarge => warn!(
                endpoint = %endpoint,
                hint = "shorten the notification body or drop data fields",
                "Push payload rejected as too large"
            ),
            ErrorClass::RateLimited => warn!(
                endpoint = %endpoint,
                hint = "lower send parallelism or back off",
                "Push service is rate limiting"
            ),
            ErrorClass::TransportUnavailable => warn!(
                endpoint = %endpoint,
                status = ?error.status_code,
                hint = "push service or gateway is failing, delivery will be retried",
                "Push transport unavailable"
            ),
            ErrorClass::ClientError | ErrorClass::Timeout | ErrorClass::NetworkError => warn!(
                endpoint = %endpoint,
                class = %class,
                error = %error.message,
                "Push delivery failed"
            ),
            ErrorClass::Unknown => warn!(
                endpoint = %endpoint,
                status = ?error.status_code,
                error = %error.message,
                "Unclassified push delivery failure"
            ),
        }
        Ok(())
    }

    async fn check_alerts(&self, now: DateTime<Utc>) -> NotificationResult<()> {
        let total_subscriptions = self.subscriptions.counts().await?.total;
        let mut state = self.state.lock().await;
        let stats = state.stats.clone();

        if total_subscriptions > 0 {
            let rate = stats.total_errors as f64 / total_subscriptions as f64;
            let message = format!(
                "{} delivery errors across {} subscriptions ({:.1}%)",
                stats.total_errors,
                total_subscriptions,
                rate * 100.0
            );
            if rate >= self.config.critical_failure_rate {
                self.raise(
                    &mut state,
                    now,
                    ErrorAlertKind::FailureRateCritical,
                    Severity::Critical,
                    message,
                );
            } else if rate >= self.config.warning_failure_rate {
                self.raise(
                    &mut state,
                    now,
                    ErrorAlertKind::FailureRateWarning,
                    Severity::Warning,
                    message,
                );
            }
        }

        let invalid = stats.count(ErrorClass::InvalidEndpoint);
        if invalid >= self.config.invalid_endpoint_threshold {
            self.raise(
                &mut state,
                now,
                ErrorAlertKind::InvalidEndpoints,
                Severity::Warning,
                format!("{} invalid endpoints removed this window", invalid),
            );
        }

        let server_errors = stats.count(ErrorClass::TransportUnavailable);
        if server_errors >= self.config.server_error_threshold {
            self.raise(
                &mut state,
                now,
                ErrorAlertKind::TransportErrors,
                Severity::Critical,
                format!("{} push transport 5xx errors this window", server_errors),
            );
        }
        Ok(())
    }

    fn raise(
        &self,
        state: &mut TrackerState,
        now: DateTime<Utc>,
        kind: ErrorAlertKind,
        severity: Severity,
        message: String,
    ) {
        let cooldown = chrono::Duration::from_std(self.config.alert_cooldown)
            .unwrap_or(chrono::Duration::zero());
        if let Some(last) = state.last_alert.get(&kind)
            && now - *last < cooldown
        {
            return;
        }

        warn!(kind = %kind, severity = %severity, message = %message, "Delivery error alert");
        counter!("notifications_error_alerts_total", "kind" => kind.to_string()).increment(1);

        state.last_alert.insert(kind, now);
        state.alerts.push_back(ErrorAlert {
            id: Uuid::now_v7(),
            kind,
            severity,
            message,
            timestamp: now,
        });
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
    }

    pub async fn stats(&self) -> ErrorStats {
        let mut state = self.state.lock().await;
        state.roll_window(Utc::now(), self.config.stats_window);
        state.stats.clone()
    }

    /// Most recent alerts, newest first.
    pub async fn recent_alerts(&self, limit: usize) -> Vec<ErrorAlert> {
        let state = self.state.lock().await;
        state.alerts.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent log entries, newest first.
    pub async fn recent_errors(&self, limit: usize) -> Vec<ErrorLogEntry> {
        let state = self.state.lock().await;
        state.log.iter().rev().take(limit).cloned().collect()
    }

    pub async fn reset_stats(&self) {
        let mut state = self.state.lock().await;
        state.stats = ErrorStats::new(Utc::now());
        state.log.clear();
        info!("Error statistics reset");
    }

    pub async fn clear_alerts(&self) {
        let mut state = self.state.lock().await;
        state.alerts.clear();
        state.last_alert.clear();
    }

    /// Delete subscriptions that have stayed disabled past the retention.
    pub async fn perform_batch_cleanup(&self) -> NotificationResult<usize> {
        let removed = self
            .subscriptions
            .cleanup_old_disabled(self.config.disabled_retention_days)
            .await?;
        if removed > 0 {
            info!(removed, "Cleaned up long-disabled subscriptions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSubscription, SubscriptionKeys};
    use crate::subscriptions::InMemorySubscriptionStore;

    async fn register(store: &InMemorySubscriptionStore, endpoint: &str) {
        store
            .upsert(NewSubscription {
                user_id: Uuid::now_v7(),
                endpoint: endpoint.to_string(),
                keys: SubscriptionKeys {
                    p256dh: "p".into(),
                    auth: "a".into(),
                },
            })
            .await
            .unwrap();
    }

    fn tracker(store: &InMemorySubscriptionStore) -> ErrorTracker {
        ErrorTracker::new(Arc::new(store.clone()), ErrorTrackerConfig::default())
    }

    #[tokio::test]
    async fn test_classification_side_effects() {
        let store = InMemorySubscriptionStore::new();
        let statuses = [404u16, 410, 413, 429, 500, 502, 503, 400, 999];
        for status in statuses {
            register(&store, &format!("https://push.test/{}", status)).await;
        }
        // Keep the failure rate low enough to stay quiet.
        for i in 0..200 {
            register(&store, &format!("https://push.test/ok/{}", i)).await;
        }
        let tracker = tracker(&store);

        let mut classes = Vec::new();
        for status in statuses {
            let endpoint = format!("https://push.test/{}", status);
            let err = DeliveryError::new(Some(status), "failed");
            let class = tracker
                .track_error(&endpoint, &err, Some("job-1"), None)
                .await
                .unwrap();
            classes.push(class);
        }

        assert_eq!(
            classes,
            vec![
                ErrorClass::InvalidEndpoint,
                ErrorClass::InvalidEndpoint,
                ErrorClass::PayloadTooLarge,
                ErrorClass::RateLimited,
                ErrorClass::TransportUnavailable,
                ErrorClass::TransportUnavailable,
                ErrorClass::TransportUnavailable,
                ErrorClass::ClientError,
                ErrorClass::Unknown,
            ]
        );

        assert!(store.get_by_endpoint("https://push.test/404").await.unwrap().is_none());
        assert!(store.get_by_endpoint("https://push.test/410").await.unwrap().is_none());
        let too_large = store.get_by_endpoint("https://push.test/413").await.unwrap().unwrap();
        assert!(too_large.enabled);

        let stats = tracker.stats().await;
        assert_eq!(stats.total_errors, 9);
        assert_eq!(stats.count(ErrorClass::TransportUnavailable), 3);
        assert_eq!(stats.by_status.get(&404), Some(&1));
        assert!(tracker.recent_alerts(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_rate_alert_respects_cooldown() {
        let store = InMemorySubscriptionStore::new();
        for i in 0..10 {
            register(&store, &format!("https://push.test/{}", i)).await;
        }
        let tracker = tracker(&store);
        let err = DeliveryError::new(Some(429), "slow down");

        tracker.track_error("https://push.test/0", &err, None, None).await.unwrap();
        let alerts = tracker.recent_alerts(10).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, ErrorAlertKind::FailureRateWarning);

        // Second error stays in the warning band and is inside the cooldown.
        tracker.track_error("https://push.test/1", &err, None, None).await.unwrap();
        assert_eq!(tracker.recent_alerts(10).await.len(), 1);

        // Third crosses into critical, a different alert kind.
        tracker.track_error("https://push.test/2", &err, None, None).await.unwrap();
        let alerts = tracker.recent_alerts(10).await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, ErrorAlertKind::FailureRateCritical);
        assert_eq!(alerts[0].severity, Severity::Critical);

        tracker.clear_alerts().await;
        assert!(tracker.recent_alerts(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_log_is_capped_and_reset_clears() {
        let store = InMemorySubscriptionStore::new();
        let config = ErrorTrackerConfig {
            max_log_entries: 3,
            ..Default::default()
        };
        let tracker = ErrorTracker::new(Arc::new(store), config);
        for i in 0..5 {
            let err = DeliveryError::new(None, format!("weird {}", i));
            tracker.track_error("https://push.test/x", &err, None, None).await.unwrap();
        }

        let log = tracker.recent_errors(10).await;
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].message, "weird 4");

        tracker.reset_stats().await;
        assert_eq!(tracker.stats().await.total_errors, 0);
        assert!(tracker.recent_errors(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_cleanup_uses_retention() {
        let store = InMemorySubscriptionStore::new();
        register(&store, "https://push.test/old").await;
        let old = store.get_by_endpoint("https://push.test/old").await.unwrap().unwrap();
        store.disable(old.id).await.unwrap();
        store.backdate_disabled(old.id, 8).await;

        let tracker = tracker(&store);
        assert_eq!(tracker.perform_batch_cleanup().await.unwrap(), 1);
        assert_eq!(tracker.perform_batch_cleanup().await.unwrap(), 0);
    }
}
