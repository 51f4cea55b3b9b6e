//! Health check handlers for queue workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue monitoring (`/queue/info`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::metrics;
use crate::registry::QueueJob;
use crate::store::JobStore;

/// Shared state for health endpoints.
pub struct HealthState<J: QueueJob> {
    /// Store used for readiness and queue monitoring.
    pub store: Arc<dyn JobStore<J>>,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Queue name for monitoring.
    pub queue_name: String,
}

impl<J: QueueJob> Clone for HealthState<J> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            queue_name: self.queue_name.clone(),
        }
    }
}

impl<J: QueueJob> HealthState<J> {
    pub fn new(
        store: Arc<dyn JobStore<J>>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            app_name: app_name.into(),
            app_version: app_version.into(),
            queue_name: queue_name.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler<J: QueueJob>(
    State(state): State<HealthState<J>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready when the job store answers a ping.
pub async fn ready_handler<J: QueueJob>(
    State(state): State<HealthState<J>>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.store.ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "store": "ok" }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "store": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue info handler for monitoring.
pub async fn queue_info_handler<J: QueueJob>(
    State(state): State<HealthState<J>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.counts().await {
        Ok(counts) => Ok(Json(json!({
            "queue": state.queue_name,
            "counts": counts,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("Failed to get queue info: {}", e) })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with the probe, queue info and metrics endpoints.
pub fn health_router<J: QueueJob>(state: HealthState<J>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<J>))
        .route("/healthz", get(health_handler::<J>))
        .route("/ready", get(ready_handler::<J>))
        .route("/readyz", get(ready_handler::<J>))
        .route("/queue/info", get(queue_info_handler::<J>))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
