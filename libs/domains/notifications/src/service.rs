//! Notification service for enqueueing and managing push jobs.

use job_queue::{Disposition, JobStore, QueueCounts};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::error::NotificationResult;
use crate::models::{EventUpdateRequest, JobHandle, NewEventRequest, NotificationJob};
use crate::targeting::UserTargeting;

/// Public entry point for producers and operators.
///
/// Enqueue calls return as soon as the job is stored; delivery happens in
/// the worker pool.
#[derive(Clone)]
pub struct NotificationService {
    queue: Arc<dyn JobStore<NotificationJob>>,
    targeting: Option<Arc<UserTargeting>>,
}

impl NotificationService {
    pub fn new(queue: Arc<dyn JobStore<NotificationJob>>) -> Self {
        Self {
            queue,
            targeting: None,
        }
    }

    /// Invalidate cached audiences on event and preference changes.
    pub fn with_targeting(mut self, targeting: Arc<UserTargeting>) -> Self {
        self.targeting = Some(targeting);
        self
    }

    /// Queue a notification to the ticket holders of a changed event.
    #[instrument(skip_all, fields(event_id = %input.event_id, change_type = %input.change_type))]
    pub async fn enqueue_event_update(
        &self,
        input: EventUpdateRequest,
    ) -> NotificationResult<JobHandle> {
        input.validate()?;
        if let Some(targeting) = &self.targeting {
            let dropped = targeting.invalidate_event(input.event_id).await;
            debug!(dropped, "Invalidated cached ticket holders");
        }
        let job = NotificationJob::event_update(input.event_id, input.change_type, input.changes);
        let handle = JobHandle::from(self.queue.enqueue(job).await?);
        log_enqueued(&handle);
        Ok(handle)
    }

    /// Queue the announcement of a newly published event.
    #[instrument(skip_all, fields(event_id = %input.event_id))]
    pub async fn enqueue_new_event(&self, input: NewEventRequest) -> NotificationResult<JobHandle> {
        let job = NotificationJob::new_event(input.event_id);
        let handle = JobHandle::from(self.queue.enqueue(job).await?);
        log_enqueued(&handle);
        Ok(handle)
    }

    /// Signal that a user's notification preferences or devices changed.
    ///
    /// Returns how many cached audiences were dropped.
    pub async fn preferences_changed(&self, user_id: Uuid) -> usize {
        let Some(targeting) = &self.targeting else {
            return 0;
        };
        let dropped = targeting.invalidate_user(user_id).await;
        debug!(user_id = %user_id, dropped, "Invalidated cached audiences for user");
        dropped
    }

    /// Move up to `limit` dead-lettered jobs back to the queue.
    pub async fn retry_failed(&self, limit: usize) -> NotificationResult<usize> {
        let retried = self.queue.retry_failed(limit).await?;
        info!(retried, "Retried failed notification jobs");
        Ok(retried)
    }

    /// Delete finished jobs older than `age`.
    pub async fn clean_old_jobs(&self, age: Duration) -> NotificationResult<usize> {
        let removed = self.queue.clean(age).await?;
        debug!(removed, age_secs = age.as_secs(), "Cleaned old notification jobs");
        Ok(removed)
    }

    pub async fn pause(&self) -> NotificationResult<()> {
        self.queue.pause().await?;
        info!("Notification queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> NotificationResult<()> {
        self.queue.resume().await?;
        info!("Notification queue resumed");
        Ok(())
    }

    pub async fn queue_stats(&self) -> NotificationResult<QueueCounts> {
        Ok(self.queue.counts().await?)
    }

    /// Cancel a job that has not started. Returns `false` if it is already
    /// running, finished or unknown.
    pub async fn cancel(&self, job_id: &str) -> NotificationResult<bool> {
        let cancelled = self.queue.cancel(job_id).await?;
        if cancelled {
            info!(job_id = %job_id, "Notification job cancelled");
        }
        Ok(cancelled)
    }
}

fn log_enqueued(handle: &JobHandle) {
    match handle.disposition {
        Disposition::Created => info!(
            job_id = %handle.job_id,
            priority = handle.priority,
            "Notification job queued"
        ),
        Disposition::Coalesced => debug!(
            job_id = %handle.job_id,
            dedupe_key = ?handle.dedupe_key,
            "Duplicate notification coalesced into live job"
        ),
        Disposition::Upgraded => info!(
            job_id = %handle.job_id,
            priority = handle.priority,
            "Waiting notification job upgraded"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use crate::subscriptions::InMemorySubscriptionStore;
    use crate::targeting::{MockAudienceDirectory, TargetFilter, TargetQuery};
    use job_queue::InMemoryJobStore;
    use serde_json::json;

    fn service() -> (NotificationService, Arc<InMemoryJobStore<NotificationJob>>) {
        let store = Arc::new(InMemoryJobStore::new());
        (NotificationService::new(store.clone()), store)
    }

    fn update(event_id: Uuid, change_type: &str) -> EventUpdateRequest {
        EventUpdateRequest {
            event_id,
            change_type: change_type.to_string(),
            changes: json!({ "starts_at": "2026-10-17T21:00:00Z" }),
        }
    }

    #[tokio::test]
    async fn test_enqueue_event_update_assigns_priority() {
        let (service, _) = service();
        let handle = service
            .enqueue_event_update(update(Uuid::now_v7(), "cancellation"))
            .await
            .unwrap();
        assert_eq!(handle.priority, 1);
        assert_eq!(handle.disposition, Disposition::Created);
        assert!(handle.dedupe_key.unwrap().starts_with("event_update:"));
    }

    #[tokio::test]
    async fn test_invalid_update_rejected() {
        let (service, store) = service();
        let err = service
            .enqueue_event_update(update(Uuid::now_v7(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation(_)));
        assert_eq!(store.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_rapid_updates_coalesce_and_upgrade() {
        let (service, _) = service();
        let event_id = Uuid::now_v7();

        let first = service
            .enqueue_event_update(update(event_id, "venue_change"))
            .await
            .unwrap();
        let duplicate = service
            .enqueue_event_update(update(event_id, "description_change"))
            .await
            .unwrap();
        let urgent = service
            .enqueue_event_update(update(event_id, "cancellation"))
            .await
            .unwrap();

        // All three land in one dedupe bucket unless a bucket boundary
        // falls between the calls.
        if first.dedupe_key == urgent.dedupe_key {
            assert_eq!(duplicate.disposition, Disposition::Coalesced);
            assert_eq!(duplicate.job_id, first.job_id);
            assert_eq!(urgent.disposition, Disposition::Upgraded);
            assert_eq!(urgent.job_id, first.job_id);
            assert_eq!(urgent.priority, 1);
            assert_eq!(service.queue_stats().await.unwrap().waiting, 1);
        }
    }

    #[tokio::test]
    async fn test_new_event_announced_once() {
        let (service, _) = service();
        let event_id = Uuid::now_v7();
        let first = service
            .enqueue_new_event(NewEventRequest { event_id })
            .await
            .unwrap();
        let second = service
            .enqueue_new_event(NewEventRequest { event_id })
            .await
            .unwrap();

        assert_eq!(first.priority, 5);
        assert_eq!(second.disposition, Disposition::Coalesced);
        assert_eq!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_cancel_pause_resume() {
        let (service, store) = service();
        let handle = service
            .enqueue_new_event(NewEventRequest {
                event_id: Uuid::now_v7(),
            })
            .await
            .unwrap();

        service.pause().await.unwrap();
        assert!(service.queue_stats().await.unwrap().paused);
        service.resume().await.unwrap();
        assert!(!service.queue_stats().await.unwrap().paused);

        assert!(service.cancel(&handle.job_id).await.unwrap());
        assert!(!service.cancel(&handle.job_id).await.unwrap());
        assert!(store.get(&handle.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_and_clean() {
        let (service, store) = service();
        let handle = service
            .enqueue_new_event(NewEventRequest {
                event_id: Uuid::now_v7(),
            })
            .await
            .unwrap();

        let record = store
            .claim("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store
            .fail(&handle.job_id, "worker-1", &record.job, "gateway down")
            .await
            .unwrap();
        assert_eq!(service.queue_stats().await.unwrap().failed, 1);

        assert_eq!(service.retry_failed(10).await.unwrap(), 1);
        assert_eq!(service.queue_stats().await.unwrap().waiting, 1);
        assert_eq!(service.clean_old_jobs(Duration::from_secs(3600)).await.unwrap(), 0);
    }

    fn targeting(resolutions: usize) -> Arc<UserTargeting> {
        let mut directory = MockAudienceDirectory::new();
        directory
            .expect_resolve_users()
            .times(resolutions)
            .returning(|_| Ok(Vec::new()));
        Arc::new(UserTargeting::new(
            Arc::new(directory),
            Arc::new(InMemorySubscriptionStore::new()),
            Duration::from_secs(300),
            100,
        ))
    }

    #[tokio::test]
    async fn test_event_update_invalidates_ticket_holder_cache() {
        let targeting = targeting(2);
        let (service, _) = service();
        let service = service.with_targeting(Arc::clone(&targeting));
        let event_id = Uuid::now_v7();
        let holders = TargetQuery::new(TargetFilter::EventTicketHolders { event_id });
        let city = TargetQuery::new(TargetFilter::City {
            city: "Lisbon".into(),
        });

        targeting.resolve(&holders).await.unwrap();
        targeting.resolve(&city).await.unwrap();
        service
            .enqueue_event_update(update(event_id, "venue_change"))
            .await
            .unwrap();

        assert_eq!(targeting.cached_entries().await, 1);
        assert!(targeting.resolve(&city).await.unwrap().cache_hit);
    }

    #[tokio::test]
    async fn test_preferences_changed_drops_category_audiences() {
        let targeting = targeting(1);
        let (service, _) = service();
        let service = service.with_targeting(Arc::clone(&targeting));

        targeting
            .resolve(&TargetQuery::new(TargetFilter::NotificationCategory {
                category: "music".into(),
            }))
            .await
            .unwrap();

        assert_eq!(service.preferences_changed(Uuid::now_v7()).await, 1);
        assert_eq!(targeting.cached_entries().await, 0);
    }

    #[tokio::test]
    async fn test_preferences_changed_without_targeting_is_noop() {
        let (service, _) = service();
        assert_eq!(service.preferences_changed(Uuid::now_v7()).await, 0);
    }
}
