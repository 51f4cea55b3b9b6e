//! Push processor for the queue worker.
//!
//! This module provides the `PushProcessor` that implements
//! `JobProcessor<NotificationJob>`: it resolves who should hear about an
//! event, fans the rendered payload out over the delivery transport and
//! reports every outcome to error tracking and the metrics collector.

use async_trait::async_trait;
use chrono::Utc;
use job_queue::{JobContext, JobProcessor, QueueError, QueueJob};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::error_tracking::ErrorTracker;
use crate::ledger::DeliveryLedger;
use crate::metrics_collector::MetricsCollector;
use crate::models::{
    ChangeType, EventSummary, MAX_PAYLOAD_BYTES, NotificationJob, PerformanceSample, PushPayload,
    PushSubscription,
};
use crate::targeting::{AudienceDirectory, TargetFilter, TargetQuery, UserTargeting};
use crate::transport::{BulkOptions, BulkSendResult, DeliveryTransport, ErrorClass, send_bulk};

/// Tuning for [`PushProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Deliveries needed for a job to count as done, capped at the number
    /// of targets.
    pub min_successful_deliveries: usize,
    pub bulk: BulkOptions,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            min_successful_deliveries: 1,
            bulk: BulkOptions::default(),
        }
    }
}

/// Processor that delivers notification jobs as push messages.
#[derive(Clone)]
pub struct PushProcessor {
    directory: Arc<dyn AudienceDirectory>,
    targeting: Arc<UserTargeting>,
    transport: Arc<dyn DeliveryTransport>,
    ledger: Arc<dyn DeliveryLedger>,
    errors: Arc<ErrorTracker>,
    metrics: Arc<MetricsCollector>,
    config: ProcessorConfig,
}

impl PushProcessor {
    pub fn new(
        directory: Arc<dyn AudienceDirectory>,
        targeting: Arc<UserTargeting>,
        transport: Arc<dyn DeliveryTransport>,
        ledger: Arc<dyn DeliveryLedger>,
        errors: Arc<ErrorTracker>,
        metrics: Arc<MetricsCollector>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            directory,
            targeting,
            transport,
            ledger,
            errors,
            metrics,
            config,
        }
    }

    async fn deliver(&self, job: &NotificationJob, ctx: &JobContext) -> NotificationResult<()> {
        let event_id = job.event_id();
        let summary = self
            .directory
            .event_summary(event_id)
            .await?
            .ok_or(NotificationError::EventNotFound(event_id))?;

        let targets = self.targeting.resolve(&target_query(job, &summary)).await?;
        let target_count = targets.subscriptions.len();
        let already_delivered = self.ledger.delivered(&ctx.job_id).await?;
        let pending: Vec<PushSubscription> = targets
            .subscriptions
            .into_iter()
            .filter(|s| !already_delivered.contains(&s.id))
            .collect();

        info!(
            job_id = %ctx.job_id,
            event_id = %event_id,
            kind = %job.job_kind(),
            attempt = ctx.attempt,
            targets = target_count,
            pending = pending.len(),
            cache_hit = targets.cache_hit,
            "Processing notification job"
        );

        let result = if pending.is_empty() {
            BulkSendResult::default()
        } else {
            let payload = build_payload(job, &summary)?;
            send_bulk(
                self.transport.as_ref(),
                &pending,
                &payload,
                &ctx.job_id,
                &self.config.bulk,
            )
            .await
        };

        let newly_delivered: Vec<Uuid> = result
            .outcomes
            .iter()
            .filter(|o| o.error_class.is_none())
            .map(|o| o.subscription_id)
            .collect();
        if let Err(e) = self
            .ledger
            .record(&ctx.job_id, &newly_delivered, job.ttl())
            .await
        {
            warn!(
                job_id = %ctx.job_id,
                error = %e,
                "Failed to record deliveries, a retry may resend them"
            );
        }

        for failure in &result.errors {
            if let Err(e) = self
                .errors
                .track_error(
                    &failure.endpoint,
                    &failure.error,
                    Some(&ctx.job_id),
                    Some(event_id),
                )
                .await
            {
                warn!(
                    job_id = %ctx.job_id,
                    subscription_id = %failure.subscription_id,
                    error = %e,
                    "Failed to track delivery error"
                );
            }
        }

        let processing_time_ms = (Utc::now() - ctx.claimed_at).num_milliseconds().max(0) as u64;
        self.metrics
            .record_job_performance(PerformanceSample {
                job_id: ctx.job_id.clone(),
                event_id,
                kind: job.job_kind(),
                processing_time_ms,
                target_count,
                sent_count: result.sent,
                failed_count: result.failed,
                timestamp: Utc::now(),
            })
            .await;

        let delivered = already_delivered.len() + newly_delivered.len();
        let required = self.config.min_successful_deliveries.min(target_count);
        if delivered >= required {
            info!(
                job_id = %ctx.job_id,
                sent = result.sent,
                failed = result.failed,
                invalid = result.invalid_endpoints.len(),
                delivered,
                processing_time_ms,
                "Notification job delivered"
            );
            return Ok(());
        }

        let error = failure_error(&result, delivered, required);
        Err(NotificationError::Queue(error))
    }
}

/// Pick the retry category for a job that missed its delivery target.
///
/// All-non-retryable failures dead-letter the job even when some
/// subscriptions were reached.
fn failure_error(result: &BulkSendResult, delivered: usize, required: usize) -> QueueError {
    let message = format!(
        "delivered to {} of {} required subscriptions ({} failed)",
        delivered, required, result.failed
    );
    let classes: Vec<ErrorClass> = result.errors.iter().map(|e| e.error.class()).collect();
    if classes.contains(&ErrorClass::RateLimited) {
        QueueError::rate_limited(message)
    } else if !classes.is_empty() && classes.iter().all(|c| !c.is_retryable()) {
        QueueError::permanent(message)
    } else {
        QueueError::transient(message)
    }
}

fn target_query(job: &NotificationJob, summary: &EventSummary) -> TargetQuery {
    let filter = match job {
        NotificationJob::EventUpdate { event_id, .. } => TargetFilter::EventTicketHolders {
            event_id: *event_id,
        },
        NotificationJob::NewEvent { .. } => match (&summary.category, &summary.city) {
            (Some(category), _) => TargetFilter::NotificationCategory {
                category: category.clone(),
            },
            (None, Some(city)) => TargetFilter::City { city: city.clone() },
            (None, None) => TargetFilter::All,
        },
    };
    TargetQuery::new(filter)
}

/// Render the device payload, enforcing the size limit.
pub fn build_payload(
    job: &NotificationJob,
    summary: &EventSummary,
) -> NotificationResult<PushPayload> {
    let url = format!("/events/{}", summary.id);
    let payload = match job {
        NotificationJob::EventUpdate {
            change_type,
            changes,
            ..
        } => {
            let (title, body) = match change_type.parse::<ChangeType>() {
                Ok(ChangeType::Cancellation) => (
                    format!("{} has been cancelled", summary.title),
                    "Check your email for refund details.".to_string(),
                ),
                Ok(ChangeType::TimeChange) => {
                    let starts_at = changes
                        .get("starts_at")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or_else(|| {
                            summary
                                .starts_at
                                .map(|t| t.format("%a %d %b, %H:%M").to_string())
                        });
                    (
                        format!("{}: new time", summary.title),
                        match starts_at {
                            Some(at) => format!("Now starting {}", at),
                            None => "The start time has changed.".to_string(),
                        },
                    )
                }
                Ok(ChangeType::VenueChange) => {
                    let venue = changes
                        .get("venue")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or_else(|| summary.venue.clone());
                    (
                        format!("{}: new venue", summary.title),
                        match venue {
                            Some(venue) => format!("Now at {}", venue),
                            None => "The venue has changed.".to_string(),
                        },
                    )
                }
                Err(_) => (
                    format!("{} was updated", summary.title),
                    "Tap to see what changed.".to_string(),
                ),
            };
            PushPayload {
                title,
                body,
                tag: Some(format!("event-{}", summary.id)),
                data: json!({
                    "event_id": summary.id,
                    "change_type": change_type,
                    "changes": changes,
                    "url": url,
                }),
            }
        }
        NotificationJob::NewEvent { .. } => {
            let when = summary.starts_at.map(|t| t.format("%a %d %b").to_string());
            let body = [when, summary.venue.clone(), summary.city.clone()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" · ");
            PushPayload {
                title: format!("New: {}", summary.title),
                body: if body.is_empty() {
                    "Tickets are on sale now.".to_string()
                } else {
                    body
                },
                tag: Some(format!("new-event-{}", summary.id)),
                data: json!({ "event_id": summary.id, "url": url }),
            }
        }
    };

    let size = payload.encoded_len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(NotificationError::PayloadTooLarge {
            size,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(payload)
}

#[async_trait]
impl JobProcessor<NotificationJob> for PushProcessor {
    async fn process(
        &self,
        job: &mut NotificationJob,
        ctx: &JobContext,
    ) -> Result<(), QueueError> {
        self.deliver(job, ctx)
            .await
            .map_err(NotificationError::into_queue_error)
    }

    fn name(&self) -> &'static str {
        "PushProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_tracking::ErrorTrackerConfig;
    use crate::ledger::InMemoryDeliveryLedger;
    use crate::models::{EventUpdateRequest, NewSubscription, SubscriptionKeys};
    use crate::service::NotificationService;
    use crate::subscriptions::{InMemorySubscriptionStore, SubscriptionStore};
    use crate::targeting::MockAudienceDirectory;
    use crate::transport::testing::ScriptedTransport;
    use job_queue::{ErrorCategory, InMemoryJobStore};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        store: InMemorySubscriptionStore,
        transport: Arc<ScriptedTransport>,
        ledger: InMemoryDeliveryLedger,
        errors: Arc<ErrorTracker>,
        metrics: Arc<MetricsCollector>,
        targeting: Arc<UserTargeting>,
        /// What the directory answers for any audience.
        holders: Arc<Mutex<Vec<Uuid>>>,
        processor: PushProcessor,
    }

    fn keys() -> SubscriptionKeys {
        SubscriptionKeys {
            p256dh: "p".into(),
            auth: "a".into(),
        }
    }

    fn summary(event_id: Uuid) -> EventSummary {
        EventSummary {
            id: event_id,
            title: "Jazz Night".to_string(),
            starts_at: None,
            venue: Some("Blue Room".to_string()),
            city: Some("Lisbon".to_string()),
            category: Some("music".to_string()),
        }
    }

    fn ctx() -> JobContext {
        ctx_for("job-1")
    }

    fn ctx_for(job_id: &str) -> JobContext {
        JobContext {
            job_id: job_id.to_string(),
            attempt: 1,
            max_attempts: 3,
            enqueued_at: Utc::now(),
            claimed_at: Utc::now(),
            worker_id: "worker-1:0".to_string(),
        }
    }

    /// One subscription per user at `https://push.test/{i}`.
    async fn harness(
        event_id: Uuid,
        subscribers: usize,
        failing: &[(usize, u16)],
        min_successful: usize,
    ) -> Harness {
        let store = InMemorySubscriptionStore::new();
        let mut users = Vec::new();
        for i in 0..subscribers {
            let user_id = Uuid::now_v7();
            users.push(user_id);
            store
                .upsert(NewSubscription {
                    user_id,
                    endpoint: format!("https://push.test/{}", i),
                    keys: keys(),
                })
                .await
                .unwrap();
        }
        let holders = Arc::new(Mutex::new(users));

        let mut directory = MockAudienceDirectory::new();
        directory
            .expect_event_summary()
            .returning(move |id| Ok((id == event_id).then(|| summary(id))));
        let answer = Arc::clone(&holders);
        directory
            .expect_resolve_users()
            .returning(move |_| Ok(answer.lock().unwrap().clone()));
        let directory: Arc<dyn AudienceDirectory> = Arc::new(directory);

        let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(store.clone());
        let transport = Arc::new(ScriptedTransport::failing(
            failing
                .iter()
                .map(|(i, status)| (format!("https://push.test/{}", i), *status)),
        ));
        let metrics = Arc::new(MetricsCollector::new(
            Arc::new(InMemoryJobStore::<NotificationJob>::new()),
            Arc::clone(&subscriptions),
        ));
        let targeting = Arc::new(UserTargeting::new(
            Arc::clone(&directory),
            Arc::clone(&subscriptions),
            Duration::from_secs(300),
            100,
        ));
        let errors = Arc::new(ErrorTracker::new(
            Arc::clone(&subscriptions),
            ErrorTrackerConfig::default(),
        ));

        let ledger = InMemoryDeliveryLedger::new();

        let processor = PushProcessor::new(
            directory,
            Arc::clone(&targeting),
            transport.clone(),
            Arc::new(ledger.clone()),
            Arc::clone(&errors),
            Arc::clone(&metrics),
            ProcessorConfig {
                min_successful_deliveries: min_successful,
                bulk: BulkOptions::default(),
            },
        );

        Harness {
            store,
            transport,
            ledger,
            errors,
            metrics,
            targeting,
            holders,
            processor,
        }
    }

    #[tokio::test]
    async fn test_partial_failure_completes_and_removes_invalid_endpoints() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 10, &[(0, 410), (1, 410), (2, 410)], 1).await;
        let mut job = NotificationJob::event_update(event_id, "time_change", json!({}));

        h.processor.process(&mut job, &ctx()).await.unwrap();

        assert_eq!(h.ledger.delivered("job-1").await.unwrap().len(), 7);
        assert_eq!(h.transport.sent().len(), 7);
        assert_eq!(h.store.counts().await.unwrap().total, 7);
        for i in 0..3 {
            let endpoint = format!("https://push.test/{}", i);
            assert!(h.store.get_by_endpoint(&endpoint).await.unwrap().is_none());
        }

        let metrics = h.metrics.collect_for_period(Default::default()).await.unwrap();
        assert_eq!(metrics.total_jobs, 1);
        assert_eq!(metrics.total_sent, 7);
        assert_eq!(metrics.total_failed, 3);
    }

    #[tokio::test]
    async fn test_later_update_does_not_target_removed_endpoint() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 4, &[(0, 410)], 1).await;

        let mut first = NotificationJob::event_update(event_id, "time_change", json!({}));
        h.processor.process(&mut first, &ctx_for("job-1")).await.unwrap();
        assert_eq!(h.store.counts().await.unwrap().total, 3);
        assert_eq!(h.errors.stats().await.count(ErrorClass::InvalidEndpoint), 1);

        let mut second = NotificationJob::event_update(event_id, "venue_change", json!({}));
        h.processor.process(&mut second, &ctx_for("job-2")).await.unwrap();

        assert_eq!(h.errors.stats().await.count(ErrorClass::InvalidEndpoint), 1);
        assert_eq!(h.errors.stats().await.total_errors, 1);
        assert_eq!(h.store.counts().await.unwrap().total, 3);
        assert_eq!(h.transport.sent().len(), 6);
        assert_eq!(h.ledger.delivered("job-2").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_event_change_reaches_new_ticket_holder() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 2, &[], 1).await;
        let service = NotificationService::new(Arc::new(InMemoryJobStore::new()))
            .with_targeting(Arc::clone(&h.targeting));

        let mut job = NotificationJob::event_update(event_id, "time_change", json!({}));
        h.processor.process(&mut job, &ctx_for("job-1")).await.unwrap();

        let buyer = Uuid::now_v7();
        h.holders.lock().unwrap().push(buyer);
        h.store
            .upsert(NewSubscription {
                user_id: buyer,
                endpoint: "https://push.test/buyer".to_string(),
                keys: keys(),
            })
            .await
            .unwrap();

        // Cached ticket holders predate the purchase.
        let mut job = NotificationJob::event_update(event_id, "time_change", json!({}));
        h.processor.process(&mut job, &ctx_for("job-2")).await.unwrap();
        assert!(!h.transport.sent().contains(&"https://push.test/buyer".to_string()));

        service
            .enqueue_event_update(EventUpdateRequest {
                event_id,
                change_type: "venue_change".to_string(),
                changes: json!({ "venue": "Main Hall" }),
            })
            .await
            .unwrap();

        let mut job = NotificationJob::event_update(event_id, "venue_change", json!({}));
        h.processor.process(&mut job, &ctx_for("job-3")).await.unwrap();
        assert!(h.transport.sent().contains(&"https://push.test/buyer".to_string()));
        assert_eq!(h.ledger.delivered("job-3").await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processing_runs_on_spawned_task() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 3, &[(2, 503)], 1).await;
        let processor = h.processor.clone();

        tokio::spawn(async move {
            let mut job = NotificationJob::new_event(event_id);
            processor.process(&mut job, &ctx()).await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_event_is_permanent() {
        let h = harness(Uuid::now_v7(), 1, &[], 1).await;
        let mut job = NotificationJob::new_event(Uuid::now_v7());

        let err = h.processor.process(&mut job, &ctx()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_retry_skips_already_delivered() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 4, &[], 1).await;
        let first = h
            .store
            .get_by_endpoint("https://push.test/0")
            .await
            .unwrap()
            .unwrap();
        h.ledger
            .record("job-1", &[first.id], Duration::from_secs(60))
            .await
            .unwrap();
        let mut job = NotificationJob::new_event(event_id);

        h.processor.process(&mut job, &ctx()).await.unwrap();

        let mut sent = h.transport.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                "https://push.test/1".to_string(),
                "https://push.test/2".to_string(),
                "https://push.test/3".to_string(),
            ]
        );
        assert_eq!(h.ledger.delivered("job-1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_categories() {
        let event_id = Uuid::now_v7();

        let h = harness(event_id, 2, &[(0, 429), (1, 500)], 1).await;
        let mut job = NotificationJob::new_event(event_id);
        let err = h.processor.process(&mut job, &ctx()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RateLimited);

        let h = harness(event_id, 2, &[(0, 503), (1, 410)], 1).await;
        let mut job = NotificationJob::new_event(event_id);
        let err = h.processor.process(&mut job, &ctx()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);

        let h = harness(event_id, 2, &[(0, 400), (1, 410)], 1).await;
        let mut job = NotificationJob::new_event(event_id);
        let err = h.processor.process(&mut job, &ctx()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);

        // Partly delivered, but nothing left is worth retrying.
        let h = harness(event_id, 3, &[(1, 400), (2, 410)], 3).await;
        let mut job = NotificationJob::new_event(event_id);
        let err = h.processor.process(&mut job, &ctx()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert_eq!(h.ledger.delivered("job-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_required_deliveries_capped_by_targets() {
        let event_id = Uuid::now_v7();
        let h = harness(event_id, 3, &[], 5).await;
        let mut job = NotificationJob::new_event(event_id);
        h.processor.process(&mut job, &ctx()).await.unwrap();
        assert_eq!(h.ledger.delivered("job-1").await.unwrap().len(), 3);

        let h = harness(event_id, 0, &[], 5).await;
        let mut job = NotificationJob::new_event(event_id);
        h.processor.process(&mut job, &ctx()).await.unwrap();
    }

    #[test]
    fn test_payload_rendering() {
        let event_id = Uuid::now_v7();
        let update = NotificationJob::event_update(
            event_id,
            "venue_change",
            json!({ "venue": "Main Hall" }),
        );
        let payload = build_payload(&update, &summary(event_id)).unwrap();
        assert_eq!(payload.title, "Jazz Night: new venue");
        assert_eq!(payload.body, "Now at Main Hall");
        assert_eq!(payload.data["url"], format!("/events/{}", event_id));

        let announce = build_payload(&NotificationJob::new_event(event_id), &summary(event_id))
            .unwrap();
        assert_eq!(announce.title, "New: Jazz Night");
        assert_eq!(announce.body, "Blue Room · Lisbon");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let event_id = Uuid::now_v7();
        let mut big = summary(event_id);
        big.title = "x".repeat(MAX_PAYLOAD_BYTES);
        let err = build_payload(&NotificationJob::new_event(event_id), &big).unwrap_err();
        assert!(matches!(err, NotificationError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_new_event_targeting_prefers_category() {
        let event_id = Uuid::now_v7();
        let job = NotificationJob::new_event(event_id);
        let mut s = summary(event_id);
        assert_eq!(
            target_query(&job, &s).filter,
            TargetFilter::NotificationCategory {
                category: "music".into()
            }
        );
        s.category = None;
        assert_eq!(
            target_query(&job, &s).filter,
            TargetFilter::City {
                city: "Lisbon".into()
            }
        );
        s.city = None;
        assert_eq!(target_query(&job, &s).filter, TargetFilter::All);
    }
}
