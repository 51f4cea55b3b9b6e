//! Per-job record of subscriptions already delivered.
//!
//! A retry consults the ledger and skips every subscription an earlier
//! attempt reached. Entries expire with the job they belong to.
//!
//! Redis layout, for prefix `P`:
//!
//! ```text
//! P:job:{id}:delivered    SET  subscription ids, PX = job ttl
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Subscriptions already delivered for `job_id`.
    async fn delivered(&self, job_id: &str) -> NotificationResult<HashSet<Uuid>>;

    /// Add deliveries for `job_id`, keeping the entry for at least `ttl`.
    async fn record(
        &self,
        job_id: &str,
        subscription_ids: &[Uuid],
        ttl: Duration,
    ) -> NotificationResult<()>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug)]
struct LedgerEntry {
    ids: HashSet<Uuid>,
    expires_at: Instant,
}

/// In-memory ledger (for development/testing)
#[derive(Debug, Default, Clone)]
pub struct InMemoryDeliveryLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn delivered(&self, job_id: &str) -> NotificationResult<HashSet<Uuid>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(job_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.ids.clone())
            .unwrap_or_default())
    }

    async fn record(
        &self,
        job_id: &str,
        subscription_ids: &[Uuid],
        ttl: Duration,
    ) -> NotificationResult<()> {
        if subscription_ids.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);
        let entry = entries.entry(job_id.to_string()).or_insert_with(|| LedgerEntry {
            ids: HashSet::new(),
            expires_at: now + ttl,
        });
        entry.ids.extend(subscription_ids.iter().copied());
        entry.expires_at = entry.expires_at.max(now + ttl);
        Ok(())
    }
}

// ============================================================================
// Redis
// ============================================================================

/// Redis implementation of [`DeliveryLedger`].
#[derive(Clone)]
pub struct RedisDeliveryLedger {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisDeliveryLedger {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}:job:{}:delivered", self.prefix, job_id)
    }
}

#[async_trait]
impl DeliveryLedger for RedisDeliveryLedger {
    async fn delivered(&self, job_id: &str) -> NotificationResult<HashSet<Uuid>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(job_id))
            .query_async(&mut conn)
            .await?;
        members
            .iter()
            .map(|raw| {
                raw.parse().map_err(|_| {
                    NotificationError::Store(format!("invalid delivery ledger entry {}", raw))
                })
            })
            .collect()
    }

    async fn record(
        &self,
        job_id: &str,
        subscription_ids: &[Uuid],
        ttl: Duration,
    ) -> NotificationResult<()> {
        if subscription_ids.is_empty() {
            return Ok(());
        }
        let key = self.key(job_id);
        let ids: Vec<String> = subscription_ids.iter().map(Uuid::to_string).collect();
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, ids)
            .ignore()
            .pexpire(&key, ttl.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
