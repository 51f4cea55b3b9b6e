//! Data models for the notifications domain.

use chrono::{DateTime, Utc};
use job_queue::{Disposition, EnqueueOutcome, QueueJob};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Job payloads
// ============================================================================

/// Width of the time bucket that coalesces rapid edits of one event.
pub const EVENT_UPDATE_DEDUPE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Event updates stop being worth delivering after a day.
pub const EVENT_UPDATE_TTL: Duration = Duration::from_secs(24 * 3600);

/// New-event announcements stay deliverable for two days.
pub const NEW_EVENT_TTL: Duration = Duration::from_secs(48 * 3600);

/// Priority used for new events and unrecognised change types.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Largest serialized `changes` object accepted on enqueue.
pub const MAX_CHANGES_BYTES: usize = 2 * 1024;

/// Largest rendered push payload.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024;

/// Change types that carry their own priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
    Cancellation,
    TimeChange,
    VenueChange,
}

impl ChangeType {
    pub fn priority(&self) -> u8 {
        match self {
            ChangeType::Cancellation => 1,
            ChangeType::TimeChange => 2,
            ChangeType::VenueChange => 3,
        }
    }

    /// Priority for a raw change type string; unknown types get the default.
    pub fn priority_for(change_type: &str) -> u8 {
        change_type
            .parse::<ChangeType>()
            .map(|c| c.priority())
            .unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Job kind label used in samples, metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    EventUpdate,
    NewEvent,
}

/// A queued notification job.
///
/// Subscriptions reached by earlier attempts are tracked in the
/// [`DeliveryLedger`](crate::ledger::DeliveryLedger), not here, so the
/// stored payload stays the same size whatever the audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationJob {
    EventUpdate {
        event_id: Uuid,
        change_type: String,
        changes: serde_json::Value,
    },
    NewEvent {
        event_id: Uuid,
    },
}

impl NotificationJob {
    pub fn event_update(
        event_id: Uuid,
        change_type: impl Into<String>,
        changes: serde_json::Value,
    ) -> Self {
        NotificationJob::EventUpdate {
            event_id,
            change_type: change_type.into(),
            changes,
        }
    }

    pub fn new_event(event_id: Uuid) -> Self {
        NotificationJob::NewEvent { event_id }
    }

    pub fn job_kind(&self) -> JobKind {
        match self {
            NotificationJob::EventUpdate { .. } => JobKind::EventUpdate,
            NotificationJob::NewEvent { .. } => JobKind::NewEvent,
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            NotificationJob::EventUpdate { event_id, .. }
            | NotificationJob::NewEvent { event_id } => *event_id,
        }
    }
}

impl QueueJob for NotificationJob {
    fn kind(&self) -> &'static str {
        match self {
            NotificationJob::EventUpdate { .. } => "event_update",
            NotificationJob::NewEvent { .. } => "new_event",
        }
    }

    fn priority(&self) -> u8 {
        match self {
            NotificationJob::EventUpdate { change_type, .. } => ChangeType::priority_for(change_type),
            NotificationJob::NewEvent { .. } => DEFAULT_PRIORITY,
        }
    }

    fn ttl(&self) -> Duration {
        match self {
            NotificationJob::EventUpdate { .. } => EVENT_UPDATE_TTL,
            NotificationJob::NewEvent { .. } => NEW_EVENT_TTL,
        }
    }

    fn dedupe_key(&self, enqueued_at: DateTime<Utc>) -> Option<String> {
        Some(match self {
            NotificationJob::EventUpdate { event_id, .. } => {
                let window_ms = EVENT_UPDATE_DEDUPE_WINDOW.as_millis() as i64;
                let bucket = enqueued_at.timestamp_millis().div_euclid(window_ms);
                format!("event_update:{}:{}", event_id, bucket)
            }
            NotificationJob::NewEvent { event_id, .. } => format!("new_event:{}", event_id),
        })
    }

    // A published event is announced once, even after the job completes.
    fn keep_dedupe_after_completion(&self) -> bool {
        matches!(self, NotificationJob::NewEvent { .. })
    }
}

// ============================================================================
// Enqueue requests
// ============================================================================

fn validate_changes(changes: &serde_json::Value) -> Result<(), validator::ValidationError> {
    if !changes.is_object() {
        return Err(validator::ValidationError::new("changes_not_object"));
    }
    let size = serde_json::to_vec(changes).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_CHANGES_BYTES {
        return Err(validator::ValidationError::new("changes_too_large"));
    }
    Ok(())
}

/// Request to notify ticket holders that an event changed.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EventUpdateRequest {
    pub event_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub change_type: String,
    #[validate(custom(function = "validate_changes"))]
    pub changes: serde_json::Value,
}

/// Request to announce a newly published event.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEventRequest {
    pub event_id: Uuid,
}

/// Handle returned by every enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub dedupe_key: Option<String>,
    pub priority: u8,
    pub disposition: Disposition,
}

impl From<EnqueueOutcome> for JobHandle {
    fn from(outcome: EnqueueOutcome) -> Self {
        Self {
            job_id: outcome.job_id,
            dedupe_key: outcome.dedupe_key,
            priority: outcome.priority,
            disposition: outcome.disposition,
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Browser push encryption keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A registered device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Globally unique.
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    pub enabled: bool,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub disabled_at: Option<DateTime<Utc>>,
}

/// Input for registering (or refreshing) a subscription.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSubscription {
    pub user_id: Uuid,
    #[validate(url, length(max = 2048))]
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// Subscription totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCounts {
    pub total: u64,
    pub enabled: u64,
    pub disabled: u64,
}

// ============================================================================
// Delivery
// ============================================================================

/// Event facts used to render a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub title: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub category: Option<String>,
}

/// What the device receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    /// Collapses notifications for the same event on the device.
    pub tag: Option<String>,
    pub data: serde_json::Value,
}

impl PushPayload {
    /// Size of the JSON encoding sent over the wire.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Sent,
    Failed,
}

/// Result of one send to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub subscription_id: Uuid,
    pub job_id: String,
    pub result: DeliveryResult,
    pub error_class: Option<crate::transport::ErrorClass>,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
}

/// Per-job performance record kept by the metrics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub job_id: String,
    pub event_id: Uuid,
    pub kind: JobKind,
    pub processing_time_ms: u64,
    pub target_count: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Severity
// ============================================================================

/// Alert and health severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}
