//! Periodic housekeeping: stale subscriptions, old jobs, expired cache
//! entries.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::NotificationResult;
use crate::error_tracking::ErrorTracker;
use crate::service::NotificationService;
use crate::targeting::UserTargeting;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub subscriptions_removed: usize,
    pub jobs_removed: usize,
    pub cache_entries_swept: usize,
}

pub struct Maintenance {
    errors: Arc<ErrorTracker>,
    service: NotificationService,
    targeting: Arc<UserTargeting>,
    job_retention: Duration,
}

impl Maintenance {
    pub fn new(
        errors: Arc<ErrorTracker>,
        service: NotificationService,
        targeting: Arc<UserTargeting>,
        job_retention: Duration,
    ) -> Self {
        Self {
            errors,
            service,
            targeting,
            job_retention,
        }
    }

    pub async fn run_once(&self) -> NotificationResult<MaintenanceReport> {
        let report = MaintenanceReport {
            subscriptions_removed: self.errors.perform_batch_cleanup().await?,
            jobs_removed: self.service.clean_old_jobs(self.job_retention).await?,
            cache_entries_swept: self.targeting.sweep().await,
        };
        info!(
            subscriptions_removed = report.subscriptions_removed,
            jobs_removed = report.jobs_removed,
            cache_entries_swept = report.cache_entries_swept,
            "Maintenance pass finished"
        );
        Ok(report)
    }

    /// Run a pass every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Maintenance pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_tracking::ErrorTrackerConfig;
    use crate::models::{NewEventRequest, NewSubscription, NotificationJob, SubscriptionKeys};
    use crate::subscriptions::{InMemorySubscriptionStore, SubscriptionStore};
    use crate::targeting::MockAudienceDirectory;
    use job_queue::{InMemoryJobStore, JobStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_run_once_reports_each_step() {
        let subscriptions = InMemorySubscriptionStore::new();
        let stale = subscriptions
            .upsert(NewSubscription {
                user_id: Uuid::now_v7(),
                endpoint: "https://push.test/stale".to_string(),
                keys: SubscriptionKeys {
                    p256dh: "p".into(),
                    auth: "a".into(),
                },
            })
            .await
            .unwrap();
        subscriptions.disable(stale.id).await.unwrap();
        subscriptions.backdate_disabled(stale.id, 30).await;

        let store = Arc::new(InMemoryJobStore::<NotificationJob>::new());
        let service = NotificationService::new(store.clone());
        let handle = service
            .enqueue_new_event(NewEventRequest {
                event_id: Uuid::now_v7(),
            })
            .await
            .unwrap();
        store
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.complete(&handle.job_id, "w").await.unwrap();

        let shared: Arc<dyn SubscriptionStore> = Arc::new(subscriptions);
        let targeting = Arc::new(UserTargeting::new(
            Arc::new(MockAudienceDirectory::new()),
            Arc::clone(&shared),
            Duration::from_secs(300),
            10,
        ));
        let errors = Arc::new(ErrorTracker::new(shared, ErrorTrackerConfig::default()));
        let maintenance = Maintenance::new(errors, service, targeting, Duration::ZERO);

        let report = maintenance.run_once().await.unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                subscriptions_removed: 1,
                jobs_removed: 1,
                cache_entries_swept: 0,
            }
        );
    }
}
