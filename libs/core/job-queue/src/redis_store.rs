//! Redis-backed job store.
//!
//! Layout under the queue prefix `P`:
//!
//! ```text
//! P:job:{id}      HASH  job record fields
//! P:waiting       ZSET  priority * 1e13 + enqueued_at_ms
//! P:delayed       ZSET  available_at_ms
//! P:active        ZSET  lease_until_ms
//! P:completed     ZSET  finished_at_ms
//! P:failed        ZSET  finished_at_ms
//! P:expired       ZSET  finished_at_ms
//! P:dedupe:{key}  STRING job id, PX = job ttl
//! P:paused        STRING present while paused
//! P:workers       ZSET  heartbeat expiry per worker id
//! ```
//!
//! Every state transition runs as a Lua script so concurrent workers in
//! different processes observe a single consistent order.

use crate::error::QueueError;
use crate::record::{Disposition, EnqueueOutcome, JobRecord, QueueCounts};
use crate::registry::QueueJob;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const ENQUEUE_SCRIPT: &str = r#"
local id = ARGV[1]
if ARGV[5] == '1' then
  local existing = redis.call('GET', KEYS[3])
  if existing then
    local ekey = ARGV[4] .. ':job:' .. existing
    local state = redis.call('HGET', ekey, 'state')
    if state == 'waiting' or state == 'active' or state == 'delayed' or state == 'completed' then
      local eprio = tonumber(redis.call('HGET', ekey, 'priority'))
      if state == 'waiting' and tonumber(ARGV[3]) < eprio then
        local enq = tonumber(redis.call('HGET', ekey, 'enqueued_at'))
        redis.call('HSET', ekey, 'job', ARGV[7], 'priority', ARGV[3])
        redis.call('ZADD', KEYS[2], string.format('%.0f', tonumber(ARGV[3]) * 1e13 + enq), existing)
        return {existing, 'upgraded', ARGV[3]}
      end
      return {existing, 'coalesced', tostring(eprio)}
    end
  end
end
local fields = {}
for i = 8, #ARGV do
  fields[#fields + 1] = ARGV[i]
end
redis.call('HSET', KEYS[1], unpack(fields))
redis.call('ZADD', KEYS[2], ARGV[2], id)
if ARGV[5] == '1' then
  redis.call('SET', KEYS[3], id, 'PX', ARGV[6])
end
return {id, 'created', ARGV[3]}
"#;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local prefix = ARGV[4]
local function requeue(id)
  local key = prefix .. ':job:' .. id
  if redis.call('EXISTS', key) == 0 then
    return
  end
  local prio = tonumber(redis.call('HGET', key, 'priority') or '5')
  local enq = tonumber(redis.call('HGET', key, 'enqueued_at') or ARGV[1])
  redis.call('HSET', key, 'state', 'waiting', 'lease_owner', '', 'lease_until', '', 'available_at', '')
  redis.call('ZADD', KEYS[1], string.format('%.0f', prio * 1e13 + enq), id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  requeue(id)
end
local stale = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(stale) do
  redis.call('ZREM', KEYS[3], id)
  requeue(id)
end
if redis.call('EXISTS', KEYS[5]) == 1 then
  return false
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local key = prefix .. ':job:' .. id
  if redis.call('EXISTS', key) == 1 then
    local expires = tonumber(redis.call('HGET', key, 'expires_at'))
    if expires and expires <= now then
      redis.call('HSET', key, 'state', 'expired', 'finished_at', ARGV[1])
      redis.call('ZADD', KEYS[4], ARGV[1], id)
      local dk = redis.call('HGET', key, 'dedupe_key')
      if dk and dk ~= '' then
        local dkey = prefix .. ':dedupe:' .. dk
        if redis.call('GET', dkey) == id then
          redis.call('DEL', dkey)
        end
      end
    else
      redis.call('HSET', key, 'state', 'active', 'lease_owner', ARGV[3], 'lease_until', ARGV[2], 'claimed_at', ARGV[1])
      redis.call('ZADD', KEYS[3], ARGV[2], id)
      return redis.call('HGETALL', key)
    end
  end
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'lease_until', ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', 'completed', 'finished_at', ARGV[3], 'lease_owner', '', 'lease_until', '')
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
local dk = redis.call('HGET', KEYS[1], 'dedupe_key')
if dk and dk ~= '' and redis.call('HGET', KEYS[1], 'keep_dedupe') ~= '1' then
  local dkey = ARGV[4] .. ':dedupe:' .. dk
  if redis.call('GET', dkey) == ARGV[1] then
    redis.call('DEL', dkey)
  end
end
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'state', 'delayed', 'job', ARGV[4], 'last_error', ARGV[5], 'available_at', ARGV[3], 'lease_owner', '', 'lease_until', '')
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'state', 'failed', 'job', ARGV[4], 'last_error', ARGV[5], 'finished_at', ARGV[3], 'lease_owner', '', 'lease_until', '')
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
local dk = redis.call('HGET', KEYS[1], 'dedupe_key')
if dk and dk ~= '' then
  local dkey = ARGV[6] .. ':dedupe:' .. dk
  if redis.call('GET', dkey) == ARGV[1] then
    redis.call('DEL', dkey)
  end
end
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'waiting' and state ~= 'delayed' then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
local dk = redis.call('HGET', KEYS[1], 'dedupe_key')
if dk and dk ~= '' then
  local dkey = ARGV[2] .. ':dedupe:' .. dk
  if redis.call('GET', dkey) == ARGV[1] then
    redis.call('DEL', dkey)
  end
end
redis.call('DEL', KEYS[1])
return 1
"#;

const RETRY_FAILED_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[2] .. ':job:' .. id
  if redis.call('EXISTS', key) == 1 then
    local prio = tonumber(redis.call('HGET', key, 'priority') or '5')
    local enq = tonumber(redis.call('HGET', key, 'enqueued_at') or '0')
    redis.call('HSET', key, 'state', 'waiting', 'attempts', '0', 'last_error', '', 'finished_at', '')
    redis.call('ZADD', KEYS[2], string.format('%.0f', prio * 1e13 + enq), id)
  end
end
return #ids
"#;

const CLEAN_SCRIPT: &str = r#"
local removed = 0
for i = 1, #KEYS do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
  for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[2] .. ':job:' .. id)
    redis.call('ZREM', KEYS[i], id)
    removed = removed + 1
  end
end
return removed
"#;

/// Per-call batch bound for `clean`.
const CLEAN_BATCH: usize = 1000;

/// Key names for one queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn dedupe(&self, key: &str) -> String {
        format!("{}:dedupe:{}", self.prefix, key)
    }

    fn set(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    pub fn waiting(&self) -> String {
        self.set("waiting")
    }

    pub fn delayed(&self) -> String {
        self.set("delayed")
    }

    pub fn active(&self) -> String {
        self.set("active")
    }

    pub fn completed(&self) -> String {
        self.set("completed")
    }

    pub fn failed(&self) -> String {
        self.set("failed")
    }

    pub fn expired(&self) -> String {
        self.set("expired")
    }

    pub fn paused(&self) -> String {
        self.set("paused")
    }

    pub fn workers(&self) -> String {
        self.set("workers")
    }
}

struct Scripts {
    enqueue: Script,
    claim: Script,
    extend: Script,
    complete: Script,
    retry: Script,
    fail: Script,
    cancel: Script,
    retry_failed: Script,
    clean: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
            retry_failed: Script::new(RETRY_FAILED_SCRIPT),
            clean: Script::new(CLEAN_SCRIPT),
        }
    }
}

fn millis_after(duration: Duration) -> i64 {
    Utc::now().timestamp_millis() + duration.as_millis().min(i64::MAX as u128 / 2) as i64
}

/// Redis `JobStore`.
pub struct RedisJobStore<J> {
    redis: ConnectionManager,
    keys: QueueKeys,
    scripts: Scripts,
    _phantom: PhantomData<fn() -> J>,
}

impl<J: QueueJob> RedisJobStore<J> {
    /// Create a store for the queue named `queue_name`.
    pub fn new(redis: ConnectionManager, queue_name: impl Into<String>) -> Self {
        let keys = QueueKeys::new(queue_name);
        info!(queue = %keys.prefix(), "Redis job store ready");
        Self {
            redis,
            keys,
            scripts: Scripts::load(),
            _phantom: PhantomData,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl<J: QueueJob> JobStore<J> for RedisJobStore<J> {
    async fn enqueue(&self, job: J) -> Result<EnqueueOutcome, QueueError> {
        let record = JobRecord::new(Uuid::now_v7().to_string(), job, Utc::now());
        let ttl_ms = (record.expires_at - record.enqueued_at).num_milliseconds().max(1);
        let dedupe = record.dedupe_key.clone();

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.keys.job(&record.id))
            .key(self.keys.waiting())
            .key(dedupe.as_deref().map(|k| self.keys.dedupe(k)).unwrap_or_default())
            .arg(&record.id)
            .arg(format!("{:.0}", record.waiting_score()))
            .arg(record.priority)
            .arg(self.keys.prefix())
            .arg(if dedupe.is_some() { "1" } else { "0" })
            .arg(ttl_ms)
            .arg(serde_json::to_string(&record.job)?);
        for (field, value) in record.to_fields()? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn();
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        let [job_id, disposition, priority] = reply.as_slice() else {
            return Err(QueueError::corrupt(&record.id, "unexpected enqueue reply"));
        };

        let disposition = match disposition.as_str() {
            "created" => Disposition::Created,
            "upgraded" => Disposition::Upgraded,
            _ => Disposition::Coalesced,
        };
        debug!(job_id = %job_id, disposition = %disposition, "Enqueued job");

        Ok(EnqueueOutcome {
            job_id: job_id.clone(),
            disposition,
            priority: priority.parse().unwrap_or(record.priority),
            dedupe_key: dedupe,
        })
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord<J>>, QueueError> {
        let mut conn = self.conn();
        let fields: Option<HashMap<String, String>> = self
            .scripts
            .claim
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.active())
            .key(self.keys.expired())
            .key(self.keys.paused())
            .arg(Utc::now().timestamp_millis())
            .arg(millis_after(lease))
            .arg(worker_id)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;

        match fields {
            Some(fields) if !fields.is_empty() => Ok(Some(JobRecord::from_fields(&fields)?)),
            _ => Ok(None),
        }
    }

    async fn extend_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .scripts
            .extend
            .key(self.keys.job(job_id))
            .key(self.keys.active())
            .arg(job_id)
            .arg(worker_id)
            .arg(millis_after(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn complete(&self, job_id: &str, worker_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .scripts
            .complete
            .key(self.keys.job(job_id))
            .key(self.keys.active())
            .key(self.keys.completed())
            .arg(job_id)
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn retry(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        delay: Duration,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .scripts
            .retry
            .key(self.keys.job(job_id))
            .key(self.keys.active())
            .key(self.keys.delayed())
            .arg(job_id)
            .arg(worker_id)
            .arg(millis_after(delay))
            .arg(serde_json::to_string(job)?)
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .scripts
            .fail
            .key(self.keys.job(job_id))
            .key(self.keys.active())
            .key(self.keys.failed())
            .arg(job_id)
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(serde_json::to_string(job)?)
            .arg(error)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .scripts
            .cancel
            .key(self.keys.job(job_id))
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .arg(job_id)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord<J>>, QueueError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(job_id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from_fields(&fields)?))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp_millis();
        let (waiting, active, delayed, completed, failed, expired, paused, workers): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            bool,
            u64,
        ) = redis::pipe()
            .zcard(self.keys.waiting())
            .zcard(self.keys.active())
            .zcard(self.keys.delayed())
            .zcard(self.keys.completed())
            .zcard(self.keys.failed())
            .zcard(self.keys.expired())
            .exists(self.keys.paused())
            .zcount(self.keys.workers(), format!("({now}"), "+inf")
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
            expired,
            paused,
            workers,
        })
    }

    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn();
        let moved: usize = self
            .scripts
            .retry_failed
            .key(self.keys.failed())
            .key(self.keys.waiting())
            .arg(limit)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn clean(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now().timestamp_millis()
            - older_than.as_millis().min(i64::MAX as u128 / 2) as i64;
        let mut conn = self.conn();
        let removed: usize = self
            .scripts
            .clean
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.expired())
            .arg(cutoff)
            .arg(self.keys.prefix())
            .arg(CLEAN_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(self.keys.paused())
            .arg("1")
            .query_async::<()>(&mut conn)
            .await?;
        info!(queue = %self.keys.prefix(), "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(self.keys.paused())
            .query_async::<()>(&mut conn)
            .await?;
        info!(queue = %self.keys.prefix(), "Queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.paused())
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(self.keys.workers())
            .arg(millis_after(ttl))
            .arg(worker_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("ZREM")
            .arg(self.keys.workers())
            .arg(worker_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn active_workers(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp_millis();
        let (live,): (u64,) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.keys.workers())
            .arg("-inf")
            .arg(now)
            .ignore()
            .zcard(self.keys.workers())
            .query_async(&mut conn)
            .await?;
        Ok(live)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(QueueError::Config(format!(
                "unexpected PING response: {response}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("notifications");
        assert_eq!(keys.job("abc"), "notifications:job:abc");
        assert_eq!(keys.dedupe("new_event:1"), "notifications:dedupe:new_event:1");
        assert_eq!(keys.waiting(), "notifications:waiting");
        assert_eq!(keys.workers(), "notifications:workers");
    }
}
