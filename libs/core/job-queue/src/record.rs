//! Stored job records and queue snapshots.

use crate::error::QueueError;
use crate::registry::QueueJob;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle state of a job.
///
/// `Waiting -> Active -> {Completed | Delayed -> Waiting | Failed}`, and
/// `Waiting -> Expired` once the TTL has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    /// Failed but retryable, waiting out its backoff.
    Delayed,
    Completed,
    /// Dead-lettered after exhausting attempts or a permanent error.
    Failed,
    Expired,
}

impl JobState {
    /// Terminal states never transition again (except an explicit retry of
    /// failed jobs).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// How an enqueue request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new job was stored.
    Created,
    /// A live job with the same dedupe key exists; the request was dropped.
    Coalesced,
    /// A waiting job with the same dedupe key was replaced by the more
    /// urgent payload.
    Upgraded,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: String,
    pub disposition: Disposition,
    /// Priority the stored job now carries.
    pub priority: u8,
    pub dedupe_key: Option<String>,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    pub paused: bool,
    /// Workers with a live heartbeat.
    pub workers: u64,
}

impl QueueCounts {
    /// Jobs not yet finished.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.delayed
    }
}

/// A job plus its queue metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<J> {
    pub id: String,
    pub kind: String,
    pub job: J,
    pub priority: u8,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub keep_dedupe: bool,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes claimable again.
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl<J: QueueJob> JobRecord<J> {
    /// Build a fresh waiting record for `job`.
    pub fn new(id: impl Into<String>, job: J, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(job.ttl()).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: id.into(),
            kind: job.kind().to_string(),
            priority: crate::registry::clamp_priority(job.priority()),
            dedupe_key: job.dedupe_key(now),
            keep_dedupe: job.keep_dedupe_after_completion(),
            job,
            state: JobState::Waiting,
            attempts: 0,
            enqueued_at: now,
            expires_at,
            lease_owner: None,
            lease_until: None,
            claimed_at: None,
            available_at: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Ordering score in the waiting set: priority first, then enqueue time.
    pub fn waiting_score(&self) -> f64 {
        waiting_score(self.priority, self.enqueued_at.timestamp_millis())
    }

    /// Flatten into Redis hash fields.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        Ok(vec![
            ("id", self.id.clone()),
            ("kind", self.kind.clone()),
            ("job", serde_json::to_string(&self.job)?),
            ("priority", self.priority.to_string()),
            ("state", self.state.to_string()),
            ("attempts", self.attempts.to_string()),
            ("enqueued_at", self.enqueued_at.timestamp_millis().to_string()),
            ("expires_at", self.expires_at.timestamp_millis().to_string()),
            ("dedupe_key", self.dedupe_key.clone().unwrap_or_default()),
            ("keep_dedupe", if self.keep_dedupe { "1" } else { "0" }.to_string()),
            ("lease_owner", self.lease_owner.clone().unwrap_or_default()),
            ("lease_until", millis_field(self.lease_until)),
            ("claimed_at", millis_field(self.claimed_at)),
            ("available_at", millis_field(self.available_at)),
            ("last_error", self.last_error.clone().unwrap_or_default()),
            ("finished_at", millis_field(self.finished_at)),
        ])
    }

    /// Rebuild from Redis hash fields. Empty strings mean "unset".
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, QueueError> {
        let id = fields
            .get("id")
            .cloned()
            .ok_or_else(|| QueueError::corrupt("<unknown>", "missing id"))?;

        let text = |name: &str| -> Option<String> {
            fields.get(name).filter(|v| !v.is_empty()).cloned()
        };
        let required = |name: &str| -> Result<String, QueueError> {
            text(name).ok_or_else(|| QueueError::corrupt(&id, format!("missing {name}")))
        };
        let number = |name: &str| -> Result<i64, QueueError> {
            required(name)?
                .parse::<i64>()
                .map_err(|e| QueueError::corrupt(&id, format!("{name}: {e}")))
        };
        let timestamp = |name: &str| -> Result<Option<DateTime<Utc>>, QueueError> {
            match text(name) {
                None => Ok(None),
                Some(raw) => {
                    let ms = raw
                        .parse::<i64>()
                        .map_err(|e| QueueError::corrupt(&id, format!("{name}: {e}")))?;
                    Ok(Some(from_millis(ms)))
                }
            }
        };

        let state = required("state")?
            .parse::<JobState>()
            .map_err(|e| QueueError::corrupt(&id, format!("state: {e}")))?;
        let job: J = serde_json::from_str(&required("job")?)?;

        Ok(Self {
            kind: text("kind").unwrap_or_else(|| job.kind().to_string()),
            priority: number("priority")? as u8,
            state,
            attempts: number("attempts")? as u32,
            enqueued_at: from_millis(number("enqueued_at")?),
            expires_at: from_millis(number("expires_at")?),
            dedupe_key: text("dedupe_key"),
            keep_dedupe: fields.get("keep_dedupe").is_some_and(|v| v == "1"),
            lease_owner: text("lease_owner"),
            lease_until: timestamp("lease_until")?,
            claimed_at: timestamp("claimed_at")?,
            available_at: timestamp("available_at")?,
            last_error: text("last_error"),
            finished_at: timestamp("finished_at")?,
            job,
            id,
        })
    }
}

/// Score used for the waiting set. Enqueue millis stay below 1e13 for the
/// next few centuries, so priority dominates and FIFO holds within it.
pub fn waiting_score(priority: u8, enqueued_at_ms: i64) -> f64 {
    f64::from(priority) * 1e13 + enqueued_at_ms as f64
}

fn millis_field(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|v| v.timestamp_millis().to_string())
        .unwrap_or_default()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
