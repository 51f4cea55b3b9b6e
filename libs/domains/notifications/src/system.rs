//! Wiring for the whole pipeline.
//!
//! [`NotificationSystem::init`] builds every component from settings and
//! injected dependencies, then starts the worker pool, the alerting loop, the
//! maintenance loop and the alert dispatcher. [`NotificationSystem::shutdown`]
//! stops all of them.

use axum::Router;
use job_queue::{HealthState, JobStore, QueueDef, QueueWorker, RedisJobStore, WorkerConfig};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerting::{
    AlertDispatcher, AlertManager, AlertSink, DEFAULT_DISPATCH_CAPACITY, EmailSink, SmtpConfig,
    WebhookSink,
};
use crate::config::NotificationSettings;
use crate::error::{NotificationError, NotificationResult};
use crate::error_tracking::{ErrorTracker, ErrorTrackerConfig};
use crate::health::{HealthApiState, health_api_router};
use crate::ledger::{DeliveryLedger, RedisDeliveryLedger};
use crate::maintenance::Maintenance;
use crate::metrics_collector::MetricsCollector;
use crate::models::NotificationJob;
use crate::processor::{ProcessorConfig, PushProcessor};
use crate::queues::PushQueue;
use crate::service::NotificationService;
use crate::subscriptions::{RedisSubscriptionStore, SubscriptionStore};
use crate::targeting::{AudienceDirectory, HttpAudienceDirectory, UserTargeting};
use crate::transport::{BulkOptions, DeliveryTransport, HttpPushTransport};
use core_config::FromEnv;

/// External collaborators of the pipeline.
pub struct NotificationDeps {
    pub queue: Arc<dyn JobStore<NotificationJob>>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub directory: Arc<dyn AudienceDirectory>,
    pub transport: Arc<dyn DeliveryTransport>,
    pub ledger: Arc<dyn DeliveryLedger>,
    pub sinks: Vec<Arc<dyn AlertSink>>,
}

impl NotificationDeps {
    /// Production dependencies: Redis-backed stores, the HTTP push gateway,
    /// the HTTP domain API and whichever alert sinks are configured.
    pub fn from_redis(
        redis: ConnectionManager,
        settings: &NotificationSettings,
    ) -> NotificationResult<Self> {
        let gateway = settings.push_gateway_url.as_deref().ok_or_else(|| {
            NotificationError::Config("PUSH_GATEWAY_URL is required".to_string())
        })?;
        let domain_api = settings.domain_api_url.as_deref().ok_or_else(|| {
            NotificationError::Config("DOMAIN_API_URL is required".to_string())
        })?;

        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if let Some(url) = &settings.alert_webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone(), settings.send_timeout)?));
        }
        if !settings.alert_email_to.is_empty() {
            let smtp = SmtpConfig::from_env()?;
            sinks.push(Arc::new(EmailSink::new(&smtp, &settings.alert_email_to)?));
        }

        Ok(Self {
            queue: Arc::new(RedisJobStore::new(redis.clone(), settings.queue_prefix.clone())),
            subscriptions: Arc::new(RedisSubscriptionStore::new(
                redis.clone(),
                settings.queue_prefix.clone(),
            )),
            ledger: Arc::new(RedisDeliveryLedger::new(redis, settings.queue_prefix.clone())),
            directory: Arc::new(HttpAudienceDirectory::new(
                domain_api,
                settings.domain_api_token.clone(),
                settings.send_timeout,
            )?),
            transport: Arc::new(HttpPushTransport::new(
                gateway,
                settings.push_gateway_token.clone(),
                settings.send_timeout,
            )?),
            sinks,
        })
    }
}

/// A running notification pipeline.
pub struct NotificationSystem {
    service: NotificationService,
    queue: Arc<dyn JobStore<NotificationJob>>,
    queue_name: String,
    api: HealthApiState,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<Result<(), job_queue::QueueError>>,
    background: Vec<(&'static str, JoinHandle<()>)>,
}

impl NotificationSystem {
    /// Build every component and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(
        settings: &NotificationSettings,
        deps: NotificationDeps,
    ) -> NotificationResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&deps.queue),
            Arc::clone(&deps.subscriptions),
        ));
        let errors = Arc::new(ErrorTracker::new(
            Arc::clone(&deps.subscriptions),
            ErrorTrackerConfig::default()
                .with_disabled_retention_days(settings.disabled_retention_days),
        ));
        let targeting = Arc::new(UserTargeting::new(
            Arc::clone(&deps.directory),
            Arc::clone(&deps.subscriptions),
            settings.targeting_cache_ttl,
            settings.targeting_cache_capacity,
        ));
        let service = NotificationService::new(Arc::clone(&deps.queue))
            .with_targeting(Arc::clone(&targeting));

        let (dispatcher, dispatcher_handle) =
            AlertDispatcher::spawn(deps.sinks, DEFAULT_DISPATCH_CAPACITY, shutdown_rx.clone());
        let alerts =
            Arc::new(AlertManager::new(Arc::clone(&collector)).with_dispatcher(dispatcher));
        let maintenance = Arc::new(Maintenance::new(
            Arc::clone(&errors),
            service.clone(),
            Arc::clone(&targeting),
            settings.job_retention,
        ));

        let processor = Arc::new(PushProcessor::new(
            deps.directory,
            targeting,
            deps.transport,
            deps.ledger,
            Arc::clone(&errors),
            Arc::clone(&collector),
            ProcessorConfig {
                min_successful_deliveries: settings.min_successful_deliveries,
                bulk: BulkOptions {
                    parallelism: settings.send_parallelism,
                    timeout: settings.send_timeout,
                },
            },
        ));

        let mut worker_config = WorkerConfig::from_queue_def::<PushQueue>()
            .with_concurrency(settings.worker_concurrency)
            .with_lease_ms(settings.lease.as_millis() as u64)
            .with_max_attempts(settings.max_attempts)
            .with_shutdown_grace_ms(settings.shutdown_grace.as_millis() as u64);
        worker_config.queue_name = settings.queue_prefix.clone();
        let queue_name = worker_config.queue_name.clone();

        let worker = QueueWorker::new(Arc::clone(&deps.queue), processor, worker_config);
        let worker = {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        let alert_loop = {
            let alerts = Arc::clone(&alerts);
            let shutdown = shutdown_rx.clone();
            let interval = settings.alert_interval;
            tokio::spawn(async move { alerts.run(interval, shutdown).await })
        };
        let maintenance_loop = {
            let maintenance = Arc::clone(&maintenance);
            let interval = settings.cleanup_interval;
            tokio::spawn(async move { maintenance.run(interval, shutdown_rx).await })
        };

        info!(
            queue = %queue_name,
            default_queue = PushQueue::QUEUE_NAME,
            concurrency = settings.worker_concurrency,
            "Notification system started"
        );

        Ok(Self {
            api: HealthApiState {
                collector,
                errors,
                alerts,
                service: service.clone(),
                maintenance,
                admin_token: settings.admin_token.clone(),
            },
            service,
            queue: deps.queue,
            queue_name,
            shutdown_tx,
            worker,
            background: vec![
                ("alerting", alert_loop),
                ("maintenance", maintenance_loop),
                ("alert-dispatcher", dispatcher_handle),
            ],
        })
    }

    /// Producer handle for enqueueing notifications.
    pub fn service(&self) -> NotificationService {
        self.service.clone()
    }

    pub fn maintenance(&self) -> Arc<Maintenance> {
        Arc::clone(&self.api.maintenance)
    }

    pub fn alerts(&self) -> Arc<AlertManager> {
        Arc::clone(&self.api.alerts)
    }

    /// Worker probes (`/healthz`, `/readyz`, `/queue/info`, `/metrics`) merged
    /// with the `/health/*` API.
    pub fn router(&self, app_name: &str, app_version: &str) -> Router {
        let probes = job_queue::health_router(HealthState::new(
            Arc::clone(&self.queue),
            app_name,
            app_version,
            self.queue_name.clone(),
        ));
        probes.merge(health_api_router(self.api.clone()))
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> NotificationResult<()> {
        info!("Shutting down notification system");
        let _ = self.shutdown_tx.send(true);

        let worker_result = match self.worker.await {
            Ok(result) => result.map_err(NotificationError::from),
            Err(e) => Err(NotificationError::Internal(format!("worker task panicked: {}", e))),
        };
        if let Err(e) = &worker_result {
            error!(error = %e, "Queue worker stopped with an error");
        }

        for (name, handle) in self.background {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        info!("Notification system stopped");
        worker_result
    }
}
