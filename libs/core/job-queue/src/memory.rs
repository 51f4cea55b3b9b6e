//! Single-process job store.
//!
//! Same semantics as the Redis store, held behind one async mutex. Used by
//! tests and by local runs that have no Redis available.

use crate::error::QueueError;
use crate::record::{Disposition, EnqueueOutcome, JobRecord, JobState, QueueCounts};
use crate::registry::QueueJob;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

struct DedupeEntry {
    job_id: String,
    expires_at: DateTime<Utc>,
}

struct MemoryState<J> {
    jobs: HashMap<String, JobRecord<J>>,
    dedupe: HashMap<String, DedupeEntry>,
    workers: HashMap<String, DateTime<Utc>>,
    paused: bool,
}

impl<J> MemoryState<J> {
    fn release_dedupe(&mut self, key: Option<&str>, job_id: &str) {
        if let Some(key) = key
            && self.dedupe.get(key).is_some_and(|e| e.job_id == job_id)
        {
            self.dedupe.remove(key);
        }
    }

    fn live_dedupe(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        self.dedupe
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.job_id.clone())
    }

    fn leased_to(&mut self, job_id: &str, worker_id: &str) -> Option<&mut JobRecord<J>> {
        self.jobs.get_mut(job_id).filter(|r| {
            r.state == JobState::Active && r.lease_owner.as_deref() == Some(worker_id)
        })
    }
}

fn requeue<J>(record: &mut JobRecord<J>) {
    record.state = JobState::Waiting;
    record.lease_owner = None;
    record.lease_until = None;
    record.available_at = None;
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// In-memory `JobStore`.
pub struct InMemoryJobStore<J> {
    state: Mutex<MemoryState<J>>,
}

impl<J> InMemoryJobStore<J> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                jobs: HashMap::new(),
                dedupe: HashMap::new(),
                workers: HashMap::new(),
                paused: false,
            }),
        }
    }
}

impl<J> Default for InMemoryJobStore<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<J: QueueJob> JobStore<J> for InMemoryJobStore<J> {
    async fn enqueue(&self, job: J) -> Result<EnqueueOutcome, QueueError> {
        let now = Utc::now();
        let record = JobRecord::new(Uuid::now_v7().to_string(), job, now);
        let mut state = self.state.lock().await;

        if let Some(key) = record.dedupe_key.clone() {
            if let Some(existing_id) = state.live_dedupe(&key, now)
                && let Some(existing) = state.jobs.get_mut(&existing_id)
            {
                match existing.state {
                    JobState::Waiting if record.priority < existing.priority => {
                        existing.job = record.job;
                        existing.priority = record.priority;
                        return Ok(EnqueueOutcome {
                            job_id: existing_id,
                            disposition: Disposition::Upgraded,
                            priority: existing.priority,
                            dedupe_key: Some(key),
                        });
                    }
                    JobState::Waiting
                    | JobState::Active
                    | JobState::Delayed
                    | JobState::Completed => {
                        return Ok(EnqueueOutcome {
                            job_id: existing_id,
                            disposition: Disposition::Coalesced,
                            priority: existing.priority,
                            dedupe_key: Some(key),
                        });
                    }
                    JobState::Failed | JobState::Expired => {}
                }
            }

            state.dedupe.insert(
                key,
                DedupeEntry {
                    job_id: record.id.clone(),
                    expires_at: record.expires_at,
                },
            );
        }

        let outcome = EnqueueOutcome {
            job_id: record.id.clone(),
            disposition: Disposition::Created,
            priority: record.priority,
            dedupe_key: record.dedupe_key.clone(),
        };
        state.jobs.insert(record.id.clone(), record);
        Ok(outcome)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord<J>>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        for record in state.jobs.values_mut() {
            match record.state {
                JobState::Delayed if record.available_at.is_none_or(|at| at <= now) => {
                    requeue(record)
                }
                JobState::Active if record.lease_until.is_none_or(|at| at <= now) => {
                    requeue(record)
                }
                _ => {}
            }
        }

        if state.paused {
            return Ok(None);
        }

        let expired: Vec<(String, Option<String>)> = state
            .jobs
            .values()
            .filter(|r| r.state == JobState::Waiting && r.is_expired_at(now))
            .map(|r| (r.id.clone(), r.dedupe_key.clone()))
            .collect();
        for (id, key) in expired {
            if let Some(record) = state.jobs.get_mut(&id) {
                record.state = JobState::Expired;
                record.finished_at = Some(now);
            }
            state.release_dedupe(key.as_deref(), &id);
        }

        let next = state
            .jobs
            .values()
            .filter(|r| r.state == JobState::Waiting)
            .min_by(|a, b| {
                (a.priority, a.enqueued_at, &a.id).cmp(&(b.priority, b.enqueued_at, &b.id))
            })
            .map(|r| r.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(record) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        record.state = JobState::Active;
        record.lease_owner = Some(worker_id.to_string());
        record.lease_until = Some(now + to_chrono(lease));
        record.claimed_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.leased_to(job_id, worker_id) {
            Some(record) => {
                record.lease_until = Some(Utc::now() + to_chrono(lease));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, job_id: &str, worker_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.leased_to(job_id, worker_id) else {
            return Ok(false);
        };
        record.state = JobState::Completed;
        record.finished_at = Some(Utc::now());
        record.lease_owner = None;
        record.lease_until = None;

        let key = record.dedupe_key.clone();
        if !record.keep_dedupe {
            state.release_dedupe(key.as_deref(), job_id);
        }
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        delay: Duration,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.leased_to(job_id, worker_id) else {
            return Ok(false);
        };
        record.job = job.clone();
        record.attempts += 1;
        record.state = JobState::Delayed;
        record.available_at = Some(Utc::now() + to_chrono(delay));
        record.last_error = Some(error.to_string());
        record.lease_owner = None;
        record.lease_until = None;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        job: &J,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.leased_to(job_id, worker_id) else {
            return Ok(false);
        };
        record.job = job.clone();
        record.attempts += 1;
        record.state = JobState::Failed;
        record.last_error = Some(error.to_string());
        record.finished_at = Some(Utc::now());
        record.lease_owner = None;
        record.lease_until = None;

        let key = record.dedupe_key.clone();
        state.release_dedupe(key.as_deref(), job_id);
        Ok(true)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let cancellable = state
            .jobs
            .get(job_id)
            .is_some_and(|r| matches!(r.state, JobState::Waiting | JobState::Delayed));
        if !cancellable {
            return Ok(false);
        }
        if let Some(record) = state.jobs.remove(job_id) {
            state.release_dedupe(record.dedupe_key.as_deref(), job_id);
        }
        Ok(true)
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord<J>>, QueueError> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut counts = QueueCounts {
            paused: state.paused,
            workers: state.workers.values().filter(|until| **until > now).count() as u64,
            ..QueueCounts::default()
        };
        for record in state.jobs.values() {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Expired => counts.expired += 1,
            }
        }
        Ok(counts)
    }

    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let mut failed: Vec<&mut JobRecord<J>> = state
            .jobs
            .values_mut()
            .filter(|r| r.state == JobState::Failed)
            .collect();
        failed.sort_by_key(|r| r.finished_at);

        let mut moved = 0;
        for record in failed.into_iter().take(limit) {
            requeue(record);
            record.attempts = 0;
            record.last_error = None;
            record.finished_at = None;
            moved += 1;
        }
        Ok(moved)
    }

    async fn clean(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - to_chrono(older_than);
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, r| {
            !(r.state.is_terminal() && r.finished_at.is_some_and(|at| at <= cutoff))
        });
        Ok(before - state.jobs.len())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.state.lock().await.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.state.lock().await.paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.paused)
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError> {
        self.state
            .lock()
            .await
            .workers
            .insert(worker_id.to_string(), Utc::now() + to_chrono(ttl));
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn active_workers(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state.workers.values().filter(|until| **until > now).count() as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
