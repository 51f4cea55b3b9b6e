//! The generic `QueueWorker` pool.
//!
//! Each worker process runs `concurrency` consumers against a shared
//! `JobStore`. A consumer claims one job at a time, renews its lease while
//! the processor runs, and acks the outcome:
//!
//! - success: `complete`
//! - retryable error with attempts left: `retry` after exponential backoff
//! - otherwise: `fail` (dead-letter)
//!
//! On shutdown consumers stop claiming, in-flight jobs get a grace period,
//! and anything still running after that is aborted. Aborted jobs keep their
//! lease until it expires and are then reclaimed by another worker.

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use crate::record::JobRecord;
use crate::registry::{JobContext, JobProcessor, QueueJob};
use crate::store::JobStore;
use chrono::Utc;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Generic queue worker pool.
///
/// # Type Parameters
///
/// * `J` - The job type (must implement `QueueJob`)
/// * `P` - The processor type (must implement `JobProcessor<J>`)
pub struct QueueWorker<J, P>
where
    J: QueueJob,
    P: JobProcessor<J>,
{
    store: Arc<dyn JobStore<J>>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: QueueMetrics,
    in_flight: Arc<AtomicUsize>,
    _phantom: PhantomData<J>,
}

impl<J, P> Clone for QueueWorker<J, P>
where
    J: QueueJob,
    P: JobProcessor<J>,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            in_flight: Arc::clone(&self.in_flight),
            _phantom: PhantomData,
        }
    }
}

impl<J, P> QueueWorker<J, P>
where
    J: QueueJob,
    P: JobProcessor<J> + 'static,
{
    pub fn new(store: Arc<dyn JobStore<J>>, processor: Arc<P>, config: WorkerConfig) -> Self {
        let metrics = QueueMetrics::new(&config.queue_name, processor.name());
        Self {
            store,
            processor,
            config,
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
            _phantom: PhantomData,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Jobs currently being processed by this pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run the pool until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue_name,
            processor = %self.processor.name(),
            concurrency = %self.config.concurrency,
            lease_ms = %self.config.lease_ms,
            max_attempts = %self.config.max_attempts,
            "Starting queue worker"
        );

        self.store
            .heartbeat(&self.config.worker_id, self.config.heartbeat_ttl())
            .await?;

        let mut consumers = JoinSet::new();
        for index in 0..self.config.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            consumers.spawn(async move { worker.consume(index, shutdown).await });
        }

        let heartbeat = {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.heartbeat_loop(shutdown).await })
        };

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(
            in_flight = %self.in_flight(),
            grace_ms = %self.config.shutdown_grace_ms,
            "Shutdown requested, draining in-flight jobs"
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            while let Some(result) = consumers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Consumer task panicked");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = %self.in_flight(),
                "Grace period elapsed, aborting remaining jobs"
            );
            consumers.abort_all();
            while consumers.join_next().await.is_some() {}
        }

        heartbeat.abort();
        if let Err(e) = self.store.deregister_worker(&self.config.worker_id).await {
            warn!(error = %e, "Failed to deregister worker");
        }

        info!(worker_id = %self.config.worker_id, "Queue worker stopped");
        Ok(())
    }

    async fn consume(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        let consumer_id = format!("{}:{}", self.config.worker_id, index);
        let mut consecutive_errors: u32 = 0;

        debug!(consumer = %consumer_id, "Consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.claim(&consumer_id, self.config.lease()).await {
                Ok(Some(record)) => {
                    if consecutive_errors > 0 {
                        info!("Store recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    self.handle(&consumer_id, record).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
                    if e.is_connection_error() {
                        warn!(
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = %backoff_secs,
                            "Store connection error, backing off"
                        );
                    } else {
                        error!(error = %e, backoff_secs = %backoff_secs, "Failed to claim job");
                    }
                    if !idle(&mut shutdown, Duration::from_secs(backoff_secs)).await {
                        break;
                    }
                    continue;
                }
            }

            if !idle(&mut shutdown, self.config.poll_interval()).await {
                break;
            }
        }

        debug!(consumer = %consumer_id, "Consumer stopped");
    }

    /// Process one claimed job and ack its outcome.
    async fn handle(&self, consumer_id: &str, record: JobRecord<J>) {
        let started = Instant::now();
        let kind = record.kind.clone();
        let ctx = JobContext {
            job_id: record.id.clone(),
            attempt: record.attempts + 1,
            max_attempts: self.config.max_attempts,
            enqueued_at: record.enqueued_at,
            claimed_at: record.claimed_at.unwrap_or_else(Utc::now),
            worker_id: consumer_id.to_string(),
        };
        let mut job = record.job.clone();

        self.metrics.job_claimed(&kind);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.in_flight(current);

        debug!(job_id = %ctx.job_id, kind = %kind, attempt = %ctx.attempt, "Processing job");

        let result = {
            let process = self.processor.process(&mut job, &ctx);
            tokio::pin!(process);
            let mut renew = tokio::time::interval(self.config.lease_renew_interval());
            renew.tick().await;

            loop {
                tokio::select! {
                    result = &mut process => break result,
                    _ = renew.tick() => {
                        match self.store.extend_lease(&ctx.job_id, consumer_id, self.config.lease()).await {
                            Ok(true) => {}
                            Ok(false) => warn!(job_id = %ctx.job_id, "Lease lost while processing"),
                            Err(e) => warn!(job_id = %ctx.job_id, error = %e, "Failed to extend lease"),
                        }
                    }
                }
            }
        };

        let acked = match result {
            Ok(()) => {
                self.metrics.job_completed(&kind, started.elapsed());
                info!(
                    job_id = %ctx.job_id,
                    kind = %kind,
                    elapsed_ms = %started.elapsed().as_millis(),
                    "Job completed"
                );
                self.store.complete(&ctx.job_id, consumer_id).await
            }
            Err(e) => {
                let category = e.category();
                self.metrics.job_failed(&kind, category.as_str());

                if e.should_retry(ctx.attempt, self.config.max_attempts) {
                    let delay = Duration::from_millis(e.backoff_delay_ms(record.attempts));
                    warn!(
                        job_id = %ctx.job_id,
                        kind = %kind,
                        attempt = %ctx.attempt,
                        error = %e,
                        error_category = ?category,
                        retry_in_ms = %delay.as_millis(),
                        "Job failed, scheduling retry"
                    );
                    self.metrics.job_retried(&kind);
                    self.store
                        .retry(&ctx.job_id, consumer_id, &job, delay, &e.to_string())
                        .await
                } else {
                    error!(
                        job_id = %ctx.job_id,
                        kind = %kind,
                        attempt = %ctx.attempt,
                        error = %e,
                        error_category = ?category,
                        "Job failed permanently, dead-lettering"
                    );
                    self.metrics.job_dead_lettered(&kind);
                    self.store
                        .fail(&ctx.job_id, consumer_id, &job, &e.to_string())
                        .await
                }
            }
        };

        match acked {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.lease_lost();
                warn!(job_id = %ctx.job_id, "Lease expired before ack, outcome discarded");
            }
            Err(e) => error!(job_id = %ctx.job_id, error = %e, "Failed to ack job"),
        }

        let current = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.in_flight(current);
    }

    async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .store
                        .heartbeat(&self.config.worker_id, self.config.heartbeat_ttl())
                        .await
                    {
                        warn!(error = %e, "Worker heartbeat failed");
                    }
                    match self.store.counts().await {
                        Ok(counts) => self.metrics.queue_depth(&counts),
                        Err(e) => debug!(error = %e, "Failed to read queue counts"),
                    }
                }
            }
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns `false` when
/// the consumer should stop.
async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobStore;
    use crate::record::JobState;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Work {
        label: String,
        priority: u8,
        fail_times: u32,
        permanent: bool,
        sleep_ms: u64,
        runs: u32,
    }

    impl Work {
        fn new(label: &str, priority: u8) -> Self {
            Self {
                label: label.into(),
                priority,
                fail_times: 0,
                permanent: false,
                sleep_ms: 0,
                runs: 0,
            }
        }
    }

    impl QueueJob for Work {
        fn kind(&self) -> &'static str {
            "work"
        }
        fn priority(&self) -> u8 {
            self.priority
        }
        fn ttl(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobProcessor<Work> for Recorder {
        async fn process(&self, job: &mut Work, _ctx: &JobContext) -> Result<(), QueueError> {
            job.runs += 1;
            if job.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(job.sleep_ms)).await;
            }
            self.seen.lock().unwrap().push(job.label.clone());
            if job.permanent {
                return Err(QueueError::permanent("bad payload"));
            }
            if job.runs <= job.fail_times {
                return Err(QueueError::transient("flaky"));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new("test")
            .with_worker_id("w")
            .with_concurrency(1)
            .with_poll_interval_ms(10)
            .with_shutdown_grace_ms(2_000)
    }

    async fn run_until<F>(worker: &QueueWorker<Work, Recorder>, done: F)
    where
        F: Fn() -> bool,
    {
        let (tx, rx) = watch::channel(false);
        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };
        for _ in 0..200 {
            if done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_consumer_processes_in_priority_order() {
        let store: Arc<InMemoryJobStore<Work>> = Arc::new(InMemoryJobStore::new());
        for (i, priority) in [1u8, 5, 2, 1, 3].into_iter().enumerate() {
            store
                .enqueue(Work::new(&format!("p{priority}-{i}"), priority))
                .await
                .unwrap();
        }

        let processor = Arc::new(Recorder::default());
        let worker = QueueWorker::new(store.clone(), Arc::clone(&processor), config());
        run_until(&worker, || processor.seen.lock().unwrap().len() == 5).await;

        let seen = processor.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["p1-0", "p1-3", "p2-2", "p3-4", "p5-1"]);
        assert_eq!(store.counts().await.unwrap().completed, 5);
    }

    #[tokio::test]
    async fn test_permanent_error_dead_letters_without_retry() {
        let store: Arc<InMemoryJobStore<Work>> = Arc::new(InMemoryJobStore::new());
        let mut job = Work::new("broken", 3);
        job.permanent = true;
        let outcome = store.enqueue(job).await.unwrap();

        let processor = Arc::new(Recorder::default());
        let worker = QueueWorker::new(store.clone(), Arc::clone(&processor), config());
        run_until(&worker, || processor.seen.lock().unwrap().len() == 1).await;

        let record = store.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.job.runs, 1);
        assert_eq!(record.last_error.as_deref(), Some("Job failed (permanent): bad payload"));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_with_backoff() {
        let store: Arc<InMemoryJobStore<Work>> = Arc::new(InMemoryJobStore::new());
        let mut job = Work::new("flaky", 3);
        job.fail_times = 1;
        let outcome = store.enqueue(job).await.unwrap();

        let processor = Arc::new(Recorder::default());
        let worker = QueueWorker::new(store.clone(), Arc::clone(&processor), config());
        run_until(&worker, || processor.seen.lock().unwrap().len() == 1).await;

        let record = store.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.attempts, 1);
        // Progress made by the failed attempt travels with the retry.
        assert_eq!(record.job.runs, 1);
        assert!(record.available_at.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let store: Arc<InMemoryJobStore<Work>> = Arc::new(InMemoryJobStore::new());
        let mut job = Work::new("never", 3);
        job.fail_times = u32::MAX;
        let outcome = store.enqueue(job).await.unwrap();

        let processor = Arc::new(Recorder::default());
        let worker = QueueWorker::new(
            store.clone(),
            Arc::clone(&processor),
            config().with_max_attempts(1),
        );
        run_until(&worker, || processor.seen.lock().unwrap().len() == 1).await;

        let record = store.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_job() {
        let store: Arc<InMemoryJobStore<Work>> = Arc::new(InMemoryJobStore::new());
        let mut job = Work::new("slow", 3);
        job.sleep_ms = 150;
        let outcome = store.enqueue(job).await.unwrap();

        let processor = Arc::new(Recorder::default());
        let worker = QueueWorker::new(store.clone(), Arc::clone(&processor), config());
        let (tx, rx) = watch::channel(false);
        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };

        for _ in 0..100 {
            if worker.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        let record = store.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(store.active_workers().await.unwrap(), 0);
    }
}
