use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use validator::Validate;

use super::SubscriptionStore;
use crate::error::NotificationResult;
use crate::models::{NewSubscription, PushSubscription, SubscriptionCounts};

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<Uuid, PushSubscription>,
    by_endpoint: HashMap<String, Uuid>,
}

/// In-memory implementation of SubscriptionStore (for development/testing)
#[derive(Debug, Default, Clone)]
pub struct InMemorySubscriptionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_enabled(sub: &mut PushSubscription, enabled: bool) {
        if sub.enabled == enabled {
            return;
        }
        sub.enabled = enabled;
        sub.disabled_at = if enabled { None } else { Some(Utc::now()) };
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn upsert(&self, input: NewSubscription) -> NotificationResult<PushSubscription> {
        input.validate()?;
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if let Some(id) = inner.by_endpoint.get(&input.endpoint).copied()
            && let Some(existing) = inner.by_id.get_mut(&id)
        {
            existing.user_id = input.user_id;
            existing.keys = input.keys;
            existing.last_seen_at = now;
            Self::set_enabled(existing, true);
            return Ok(existing.clone());
        }

        let sub = PushSubscription {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            endpoint: input.endpoint,
            keys: input.keys,
            enabled: true,
            last_seen_at: now,
            created_at: now,
            disabled_at: None,
        };
        inner.by_endpoint.insert(sub.endpoint.clone(), sub.id);
        inner.by_id.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn get(&self, id: Uuid) -> NotificationResult<Option<PushSubscription>> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn get_by_endpoint(
        &self,
        endpoint: &str,
    ) -> NotificationResult<Option<PushSubscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_endpoint
            .get(endpoint)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn list_enabled_for_users(
        &self,
        user_ids: &[Uuid],
    ) -> NotificationResult<Vec<PushSubscription>> {
        let inner = self.inner.read().await;
        let mut subs: Vec<_> = inner
            .by_id
            .values()
            .filter(|s| s.enabled && user_ids.contains(&s.user_id))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn enable(&self, id: Uuid) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .by_id
            .get_mut(&id)
            .map(|s| Self::set_enabled(s, true))
            .is_some())
    }

    async fn disable(&self, id: Uuid) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .by_id
            .get_mut(&id)
            .map(|s| Self::set_enabled(s, false))
            .is_some())
    }

    async fn delete(&self, id: Uuid) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.by_id.remove(&id) {
            Some(sub) => {
                inner.by_endpoint.remove(&sub.endpoint);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn disable_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool> {
        let id = self.inner.read().await.by_endpoint.get(endpoint).copied();
        match id {
            Some(id) => self.disable(id).await,
            None => Ok(false),
        }
    }

    async fn delete_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool> {
        let id = self.inner.read().await.by_endpoint.get(endpoint).copied();
        match id {
            Some(id) => self.delete(id).await,
            None => Ok(false),
        }
    }

    async fn touch(&self, id: Uuid) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .by_id
            .get_mut(&id)
            .map(|s| s.last_seen_at = Utc::now())
            .is_some())
    }

    async fn cleanup_old_disabled(&self, days: i64) -> NotificationResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut inner = self.inner.write().await;
        let stale: Vec<_> = inner
            .by_id
            .values()
            .filter(|s| !s.enabled && s.disabled_at.is_some_and(|at| at <= cutoff))
            .map(|s| (s.id, s.endpoint.clone()))
            .collect();
        for (id, endpoint) in &stale {
            inner.by_id.remove(id);
            inner.by_endpoint.remove(endpoint);
        }
        Ok(stale.len())
    }

    async fn counts(&self) -> NotificationResult<SubscriptionCounts> {
        let inner = self.inner.read().await;
        let total = inner.by_id.len() as u64;
        let enabled = inner.by_id.values().filter(|s| s.enabled).count() as u64;
        Ok(SubscriptionCounts {
            total,
            enabled,
            disabled: total - enabled,
        })
    }
}

#[cfg(test)]
impl InMemorySubscriptionStore {
    /// Move a subscription's `disabled_at` into the past.
    pub(crate) async fn backdate_disabled(&self, id: Uuid, days: i64) {
        let mut inner = self.inner.write().await;
        if let Some(sub) = inner.by_id.get_mut(&id) {
            sub.disabled_at = Some(Utc::now() - chrono::Duration::days(days));
        }
    }
}
