//! Redis-backed subscription store.
//!
//! Key layout, for prefix `P`:
//!
//! ```text
//! P:sub:{id}          HASH  subscription fields
//! P:sub:endpoints     HASH  endpoint -> id (uniqueness index)
//! P:sub:user:{uid}    SET   subscription ids of one user
//! P:sub:enabled       SET   enabled subscription ids
//! P:sub:disabled      ZSET  disabled subscription ids scored by disabled_at (ms)
//! ```
//!
//! Every mutation that touches more than one key runs as a Lua script.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

use super::SubscriptionStore;
use crate::error::{NotificationError, NotificationResult};
use crate::models::{NewSubscription, PushSubscription, SubscriptionCounts, SubscriptionKeys};

// KEYS: endpoints index. ARGV: prefix, candidate id, user_id, endpoint, p256dh, auth, now_ms.
const UPSERT: &str = r#"
local prefix = ARGV[1]
local id = redis.call('HGET', KEYS[1], ARGV[4])
if id then
  local key = prefix .. ':sub:' .. id
  local old_user = redis.call('HGET', key, 'user_id')
  if old_user and old_user ~= ARGV[3] then
    redis.call('SREM', prefix .. ':sub:user:' .. old_user, id)
  end
  redis.call('HSET', key, 'user_id', ARGV[3], 'p256dh', ARGV[5], 'auth', ARGV[6],
    'enabled', '1', 'last_seen_at', ARGV[7], 'disabled_at', '')
else
  id = ARGV[2]
  redis.call('HSET', prefix .. ':sub:' .. id, 'id', id, 'user_id', ARGV[3], 'endpoint', ARGV[4],
    'p256dh', ARGV[5], 'auth', ARGV[6], 'enabled', '1', 'last_seen_at', ARGV[7],
    'created_at', ARGV[7], 'disabled_at', '')
  redis.call('HSET', KEYS[1], ARGV[4], id)
end
redis.call('SADD', prefix .. ':sub:user:' .. ARGV[3], id)
redis.call('SADD', prefix .. ':sub:enabled', id)
redis.call('ZREM', prefix .. ':sub:disabled', id)
return id
"#;

// ARGV: prefix, id, enabled ('1' | '0'), now_ms. Returns 0 when missing.
const SET_ENABLED: &str = r#"
local prefix = ARGV[1]
local key = prefix .. ':sub:' .. ARGV[2]
if redis.call('EXISTS', key) == 0 then return 0 end
if redis.call('HGET', key, 'enabled') == ARGV[3] then return 1 end
if ARGV[3] == '1' then
  redis.call('HSET', key, 'enabled', '1', 'disabled_at', '')
  redis.call('SADD', prefix .. ':sub:enabled', ARGV[2])
  redis.call('ZREM', prefix .. ':sub:disabled', ARGV[2])
else
  redis.call('HSET', key, 'enabled', '0', 'disabled_at', ARGV[4])
  redis.call('SREM', prefix .. ':sub:enabled', ARGV[2])
  redis.call('ZADD', prefix .. ':sub:disabled', ARGV[4], ARGV[2])
end
return 1
"#;

// ARGV: prefix, id. Returns 0 when missing.
const DELETE: &str = r#"
local prefix = ARGV[1]
local key = prefix .. ':sub:' .. ARGV[2]
local fields = redis.call('HMGET', key, 'endpoint', 'user_id')
if not fields[1] then return 0 end
redis.call('DEL', key)
redis.call('HDEL', prefix .. ':sub:endpoints', fields[1])
redis.call('SREM', prefix .. ':sub:user:' .. fields[2], ARGV[2])
redis.call('SREM', prefix .. ':sub:enabled', ARGV[2])
redis.call('ZREM', prefix .. ':sub:disabled', ARGV[2])
return 1
"#;

// KEYS: subscription hash. ARGV: now_ms.
const TOUCH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'last_seen_at', ARGV[1])
return 1
"#;

struct Scripts {
    upsert: Script,
    toggle: Script,
    delete: Script,
    touch: Script,
}

/// Redis implementation of [`SubscriptionStore`].
#[derive(Clone)]
pub struct RedisSubscriptionStore {
    redis: ConnectionManager,
    prefix: String,
    scripts: Arc<Scripts>,
}

impl RedisSubscriptionStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            scripts: Arc::new(Scripts {
                upsert: Script::new(UPSERT),
                toggle: Script::new(SET_ENABLED),
                delete: Script::new(DELETE),
                touch: Script::new(TOUCH),
            }),
        }
    }

    fn sub_key(&self, id: &str) -> String {
        format!("{}:sub:{}", self.prefix, id)
    }

    fn endpoints_key(&self) -> String {
        format!("{}:sub:endpoints", self.prefix)
    }

    fn user_key(&self, user_id: Uuid) -> String {
        format!("{}:sub:user:{}", self.prefix, user_id)
    }

    fn enabled_key(&self) -> String {
        format!("{}:sub:enabled", self.prefix)
    }

    fn disabled_key(&self) -> String {
        format!("{}:sub:disabled", self.prefix)
    }

    async fn load(&self, id: &str) -> NotificationResult<Option<PushSubscription>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.sub_key(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_subscription(&fields).map(Some)
    }

    async fn id_for_endpoint(&self, endpoint: &str) -> NotificationResult<Option<String>> {
        let mut conn = self.redis.clone();
        let id: Option<String> = redis::cmd("HGET")
            .arg(self.endpoints_key())
            .arg(endpoint)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let found: i64 = self
            .scripts
            .toggle
            .arg(&self.prefix)
            .arg(id)
            .arg(if enabled { "1" } else { "0" })
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(found == 1)
    }

    async fn delete_id(&self, id: &str) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let found: i64 = self
            .scripts
            .delete
            .arg(&self.prefix)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(found == 1)
    }
}

fn millis(
    fields: &HashMap<String, String>,
    name: &str,
) -> NotificationResult<Option<DateTime<Utc>>> {
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => {
            let ms: i64 = raw.parse().map_err(|_| {
                NotificationError::Store(format!("subscription field {} is not a timestamp", name))
            })?;
            Ok(DateTime::from_timestamp_millis(ms))
        }
    }
}

fn parse_subscription(fields: &HashMap<String, String>) -> NotificationResult<PushSubscription> {
    let text = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| NotificationError::Store(format!("subscription missing {}", name)))
    };
    let uuid = |name: &str| -> NotificationResult<Uuid> {
        text(name)?
            .parse()
            .map_err(|_| NotificationError::Store(format!("subscription {} is not a UUID", name)))
    };
    let created_at = millis(fields, "created_at")?
        .ok_or_else(|| NotificationError::Store("subscription missing created_at".into()))?;

    Ok(PushSubscription {
        id: uuid("id")?,
        user_id: uuid("user_id")?,
        endpoint: text("endpoint")?,
        keys: SubscriptionKeys {
            p256dh: text("p256dh")?,
            auth: text("auth")?,
        },
        enabled: fields.get("enabled").is_some_and(|v| v == "1"),
        last_seen_at: millis(fields, "last_seen_at")?.unwrap_or(created_at),
        created_at,
        disabled_at: millis(fields, "disabled_at")?,
    })
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn upsert(&self, input: NewSubscription) -> NotificationResult<PushSubscription> {
        input.validate()?;
        let mut conn = self.redis.clone();
        let id: String = self
            .scripts
            .upsert
            .key(self.endpoints_key())
            .arg(&self.prefix)
            .arg(Uuid::now_v7().to_string())
            .arg(input.user_id.to_string())
            .arg(&input.endpoint)
            .arg(&input.keys.p256dh)
            .arg(&input.keys.auth)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        debug!(subscription_id = %id, user_id = %input.user_id, "Subscription upserted");

        self.load(&id)
            .await?
            .ok_or_else(|| NotificationError::Store(format!("subscription {} vanished", id)))
    }

    async fn get(&self, id: Uuid) -> NotificationResult<Option<PushSubscription>> {
        self.load(&id.to_string()).await
    }

    async fn get_by_endpoint(
        &self,
        endpoint: &str,
    ) -> NotificationResult<Option<PushSubscription>> {
        match self.id_for_endpoint(endpoint).await? {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn list_enabled_for_users(
        &self,
        user_ids: &[Uuid],
    ) -> NotificationResult<Vec<PushSubscription>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.smembers(self.user_key(*user_id));
        }
        let per_user: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;
        let ids: Vec<String> = per_user.into_iter().flatten().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.sub_key(id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut subs = Vec::with_capacity(rows.len());
        for fields in rows.iter().filter(|f| !f.is_empty()) {
            let sub = parse_subscription(fields)?;
            if sub.enabled {
                subs.push(sub);
            }
        }
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn enable(&self, id: Uuid) -> NotificationResult<bool> {
        self.set_enabled(&id.to_string(), true).await
    }

    async fn disable(&self, id: Uuid) -> NotificationResult<bool> {
        self.set_enabled(&id.to_string(), false).await
    }

    async fn delete(&self, id: Uuid) -> NotificationResult<bool> {
        self.delete_id(&id.to_string()).await
    }

    async fn disable_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool> {
        match self.id_for_endpoint(endpoint).await? {
            Some(id) => self.set_enabled(&id, false).await,
            None => Ok(false),
        }
    }

    async fn delete_by_endpoint(&self, endpoint: &str) -> NotificationResult<bool> {
        match self.id_for_endpoint(endpoint).await? {
            Some(id) => self.delete_id(&id).await,
            None => Ok(false),
        }
    }

    async fn touch(&self, id: Uuid) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let found: i64 = self
            .scripts
            .touch
            .key(self.sub_key(&id.to_string()))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(found == 1)
    }

    async fn cleanup_old_disabled(&self, days: i64) -> NotificationResult<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).timestamp_millis();
        let mut conn = self.redis.clone();
        let stale: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.disabled_key())
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;

        let mut removed = 0;
        for id in &stale {
            if self.delete_id(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn counts(&self) -> NotificationResult<SubscriptionCounts> {
        let mut conn = self.redis.clone();
        let (total, enabled): (u64, u64) = redis::pipe()
            .hlen(self.endpoints_key())
            .scard(self.enabled_key())
            .query_async(&mut conn)
            .await?;
        Ok(SubscriptionCounts {
            total,
            enabled,
            disabled: total.saturating_sub(enabled),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_round_trips_hash_fields() {
        let id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let fields: HashMap<String, String> = [
            ("id", id.to_string()),
            ("user_id", user_id.to_string()),
            ("endpoint", "https://push.test/x".to_string()),
            ("p256dh", "k".to_string()),
            ("auth", "a".to_string()),
            ("enabled", "0".to_string()),
            ("created_at", "1700000000000".to_string()),
            ("last_seen_at", "1700000001000".to_string()),
            ("disabled_at", "1700000002000".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let sub = parse_subscription(&fields).unwrap();
        assert_eq!(sub.id, id);
        assert_eq!(sub.user_id, user_id);
        assert!(!sub.enabled);
        assert_eq!(sub.disabled_at.unwrap().timestamp_millis(), 1_700_000_002_000);
    }

    #[test]
    fn test_parse_subscription_missing_field() {
        let fields: HashMap<String, String> =
            [("id".to_string(), Uuid::now_v7().to_string())].into_iter().collect();
        assert!(matches!(
            parse_subscription(&fields),
            Err(NotificationError::Store(_))
        ));
    }
}
