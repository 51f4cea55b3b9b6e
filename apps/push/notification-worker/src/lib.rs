//! Push Notification Worker Service
//!
//! Runs the notification pipeline: a pool of queue consumers delivering push
//! messages, the alerting loop, periodic maintenance and an HTTP server for
//! probes and the `/health/*` API.
//!
//! ## Architecture
//!
//! ```text
//! Redis job queue (notifications)
//!   ↓ (leased claims, priority order)
//! QueueWorker<NotificationJob, PushProcessor>
//!   ↓ (targeting, payload, bulk send)
//! Push gateway
//! ```
//!
//! ## Endpoints
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz`
//! - Queue counts: `/queue/info`, `/health/queue`
//! - Prometheus metrics: `/metrics`
//! - Pipeline health, metrics, errors and alerts: `/health/*`

use axum::Router;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use domain_notifications::{NotificationDeps, NotificationSettings, NotificationSystem};
use eyre::{Result, WrapErr};
use job_queue::connection::{ConnectRetry, connect_with_retry};
use job_queue::metrics;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the notification worker
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Installs the Prometheus recorder
/// 3. Connects to Redis with retry
/// 4. Starts the notification system and the HTTP server
/// 5. On SIGINT/SIGTERM, stops the server and then the pipeline
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable, the
/// listener cannot bind, or the worker stops with an error.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting push notification worker");

    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let settings =
        NotificationSettings::from_env().wrap_err("Failed to load notification settings")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let redis = connect_with_retry(
        &redis_config.uri,
        ConnectRetry::default().with_max_retries(redis_config.connect_retries),
    )
    .await
    .wrap_err("Failed to connect to Redis")?;

    let deps = NotificationDeps::from_redis(redis, &settings)
        .wrap_err("Failed to build notification dependencies")?;
    let system = NotificationSystem::init(&settings, deps)
        .wrap_err("Failed to start notification system")?;

    let app: Router = system
        .router(APP_NAME, APP_VERSION)
        .layer(TraceLayer::new_for_http());

    let addr = server_config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("HTTP server failed")?;

    system
        .shutdown()
        .await
        .wrap_err("Notification system stopped with an error")?;

    info!("Push notification worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
