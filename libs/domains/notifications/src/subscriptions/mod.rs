//! Registry of device push subscriptions.
//!
//! Endpoints are globally unique: registering a known endpoint refreshes the
//! existing subscription instead of adding a second one.

mod memory;
mod redis;

pub use memory::InMemorySubscriptionStore;
pub use redis::RedisSubscriptionStore;

use crate::error::NotificationResult;
use crate::models::{NewSubscription, PushSubscription, SubscriptionCounts};
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence for push subscriptions.
///
/// Mutators return `false` when the subscription does not exist.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Register an endpoint, or refresh and re-enable the one already stored.
    async fn upsert(&self, input: NewSubscription) -> NotificationResult<PushSubscription>;

    async fn get(&self, id: Uuid) -> NotificationResult<Option<PushSubscription>>;

    async fn get_by_endpoint(&self, endpoint: &str)
    -> NotificationResult<Option<PushSubscription>>;

    /// Enabled subscriptions belonging to any of `user_ids`.
    async fn list_enabled_for_users(
        &self,
        user_ids: &[Uuid],
    ) -> NotificationResult<Vec<PushSubscription>>;

    async fn enable(&self, id: Uuid) -> NotificationResult<bool>;

    /// Soft failure: keep the row but stop delivering to it.
    async fn disable(&self, id: Uuid) -> NotificationResult<bool>;

    async fn delete(&self, id: Uuid) -> NotificationResult<bool>;

    async fn disable_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool>;

    async fn delete_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool>;

    /// Record that the device was seen.
    async fn touch(&self, id: Uuid) -> NotificationResult<bool>;

    /// Delete subscriptions disabled for longer than `days`. Returns how many.
    async fn cleanup_old_disabled(&self, days: i64) -> NotificationResult<usize>;

    async fn counts(&self) -> NotificationResult<SubscriptionCounts>;
}
