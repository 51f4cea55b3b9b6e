//! Integration tests for `RedisSubscriptionStore` and `RedisDeliveryLedger`
//! against a real Redis.
//!
//! Run with `cargo test -p domain_notifications -- --ignored` (requires Docker).

use domain_notifications::error_tracking::{ErrorTracker, ErrorTrackerConfig};
use domain_notifications::models::{NewSubscription, SubscriptionCounts, SubscriptionKeys};
use domain_notifications::transport::{DeliveryError, ErrorClass};
use domain_notifications::{
    DeliveryLedger, RedisDeliveryLedger, RedisSubscriptionStore, SubscriptionStore,
};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};
use uuid::Uuid;

async fn store(redis: &TestRedis, test: &str) -> (RedisSubscriptionStore, TestDataBuilder) {
    let data = TestDataBuilder::from_test_name(test);
    let store =
        RedisSubscriptionStore::new(redis.connection_manager().await, data.queue_name("subs"));
    (store, data)
}

fn new_sub(user_id: Uuid, endpoint: String) -> NewSubscription {
    NewSubscription {
        user_id,
        endpoint,
        keys: SubscriptionKeys {
            p256dh: "p256dh-key".into(),
            auth: "auth-key".into(),
        },
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn resubscribing_same_endpoint_updates_row() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "resubscribing_same_endpoint_updates_row").await;

    let first = store.upsert(new_sub(data.id(1), data.endpoint(1))).await.unwrap();
    store.disable(first.id).await.unwrap();
    let second = store.upsert(new_sub(data.id(2), data.endpoint(1))).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.user_id, data.id(2));
    assert!(second.enabled);
    assert_eq!(store.counts().await.unwrap().total, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lists_only_enabled_subscriptions_of_requested_users() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "lists_only_enabled_subscriptions").await;

    let alice = data.id(1);
    let bob = data.id(2);
    let a1 = store.upsert(new_sub(alice, data.endpoint(1))).await.unwrap();
    let a2 = store.upsert(new_sub(alice, data.endpoint(2))).await.unwrap();
    store.upsert(new_sub(bob, data.endpoint(3))).await.unwrap();
    store.disable(a2.id).await.unwrap();

    let subs = store.list_enabled_for_users(&[alice]).await.unwrap();
    assert_eq!(subs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a1.id]);

    assert_eq!(
        store.counts().await.unwrap(),
        SubscriptionCounts {
            total: 3,
            enabled: 2,
            disabled: 1,
        }
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cleanup_removes_disabled_rows() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "cleanup_removes_disabled_rows").await;

    let stale = store.upsert(new_sub(data.id(1), data.endpoint(1))).await.unwrap();
    let live = store.upsert(new_sub(data.id(2), data.endpoint(2))).await.unwrap();
    store.disable(stale.id).await.unwrap();

    assert_eq!(store.cleanup_old_disabled(0).await.unwrap(), 1);
    assert!(store.get(stale.id).await.unwrap().is_none());
    assert!(store.get_by_endpoint(&data.endpoint(1)).await.unwrap().is_none());
    assert!(store.get(live.id).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn gone_endpoint_is_deleted_by_error_tracker() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "gone_endpoint_is_deleted").await;
    let store = Arc::new(store);

    store.upsert(new_sub(data.id(1), data.endpoint(1))).await.unwrap();
    let kept = store.upsert(new_sub(data.id(2), data.endpoint(2))).await.unwrap();

    let tracker = ErrorTracker::new(store.clone(), ErrorTrackerConfig::default());
    let gone = tracker
        .track_error(
            &data.endpoint(1),
            &DeliveryError::new(Some(410), "Gone"),
            None,
            None,
        )
        .await
        .unwrap();
    let too_large = tracker
        .track_error(
            &data.endpoint(2),
            &DeliveryError::new(Some(413), "Payload Too Large"),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(gone, ErrorClass::InvalidEndpoint);
    assert_eq!(too_large, ErrorClass::PayloadTooLarge);
    assert!(store.get_by_endpoint(&data.endpoint(1)).await.unwrap().is_none());
    assert!(store.get(kept.id).await.unwrap().unwrap().enabled);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn delivery_ledger_accumulates_and_expires() {
    let redis = TestRedis::new().await;
    let data = TestDataBuilder::from_test_name("delivery_ledger_accumulates_and_expires");
    let ledger =
        RedisDeliveryLedger::new(redis.connection_manager().await, data.queue_name("ledger"));

    ledger
        .record("job-1", &[data.id(1)], Duration::from_secs(60))
        .await
        .unwrap();
    ledger
        .record("job-1", &[data.id(1), data.id(2)], Duration::from_secs(60))
        .await
        .unwrap();
    let delivered = ledger.delivered("job-1").await.unwrap();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.contains(&data.id(2)));

    ledger
        .record("job-2", &[data.id(3)], Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ledger.delivered("job-2").await.unwrap().is_empty());
}
