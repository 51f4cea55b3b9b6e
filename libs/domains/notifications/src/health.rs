//! `/health/*` endpoints for the notification pipeline.
//!
//! Read-only routes expose system health, queue counts, windowed metrics,
//! error statistics and active alerts. Admin routes (maintenance, clearing
//! alerts, resetting error statistics) require the `x-admin-token` header.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerting::AlertManager;
use crate::error_tracking::ErrorTracker;
use crate::maintenance::Maintenance;
use crate::metrics_collector::{HealthStatus, MetricsCollector, MetricsPeriod};
use crate::service::NotificationService;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const RECENT_LIMIT: usize = 50;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

#[derive(Clone)]
pub struct HealthApiState {
    pub collector: Arc<MetricsCollector>,
    pub errors: Arc<ErrorTracker>,
    pub alerts: Arc<AlertManager>,
    pub service: NotificationService,
    pub maintenance: Arc<Maintenance>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    pub period: Option<MetricsPeriod>,
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{}: {}", context, e) })),
    )
}

fn require_admin(
    state: &HealthApiState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let provided = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    match (state.admin_token.as_deref(), provided) {
        (Some(expected), Some(given)) if expected == given => Ok(()),
        _ => {
            warn!("Rejected admin request");
            Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "admin token required" })),
            ))
        }
    }
}

pub async fn system_health_handler(State(state): State<HealthApiState>) -> ApiResult {
    let health = state.collector.system_health().await;
    let body = Json(json!(health));
    if health.overall == HealthStatus::Critical {
        Err((StatusCode::SERVICE_UNAVAILABLE, body))
    } else {
        Ok((StatusCode::OK, body))
    }
}

pub async fn queue_handler(State(state): State<HealthApiState>) -> ApiResult {
    let counts = state
        .service
        .queue_stats()
        .await
        .map_err(|e| internal_error("Failed to read queue counts", e))?;
    Ok((StatusCode::OK, Json(json!({ "counts": counts }))))
}

/// `?period=` accepts hour, day, week or month; anything else is a 400 from
/// the query extractor.
pub async fn metrics_handler(
    State(state): State<HealthApiState>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult {
    let period = query.period.unwrap_or_default();
    let metrics = state
        .collector
        .collect_for_period(period)
        .await
        .map_err(|e| internal_error("Failed to collect metrics", e))?;
    Ok((
        StatusCode::OK,
        Json(json!({ "period": period, "metrics": metrics })),
    ))
}

pub async fn errors_handler(State(state): State<HealthApiState>) -> ApiResult {
    let stats = state.errors.stats().await;
    let alerts = state.errors.recent_alerts(RECENT_LIMIT).await;
    let recent = state.errors.recent_errors(RECENT_LIMIT).await;
    Ok((
        StatusCode::OK,
        Json(json!({
            "stats": stats,
            "alerts": alerts,
            "recent_errors": recent,
        })),
    ))
}

pub async fn alerts_handler(State(state): State<HealthApiState>) -> ApiResult {
    let alerts = state.alerts.active_alerts().await;
    Ok((
        StatusCode::OK,
        Json(json!({ "count": alerts.len(), "alerts": alerts })),
    ))
}

pub async fn maintenance_handler(
    State(state): State<HealthApiState>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let report = state
        .maintenance
        .run_once()
        .await
        .map_err(|e| internal_error("Maintenance failed", e))?;
    Ok((StatusCode::OK, Json(json!({ "report": report }))))
}

pub async fn clear_alerts_handler(
    State(state): State<HealthApiState>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let cleared = state.alerts.clear_alerts().await;
    state.errors.clear_alerts().await;
    info!(cleared, "Alerts cleared");
    Ok((StatusCode::OK, Json(json!({ "cleared": cleared }))))
}

pub async fn reset_errors_handler(
    State(state): State<HealthApiState>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&state, &headers)?;
    state.errors.reset_stats().await;
    info!("Error statistics reset");
    Ok((StatusCode::OK, Json(json!({ "reset": true }))))
}

pub fn health_api_router(state: HealthApiState) -> Router {
    Router::new()
        .route("/health/system", get(system_health_handler))
        .route("/health/queue", get(queue_handler))
        .route("/health/metrics", get(metrics_handler))
        .route("/health/errors", get(errors_handler))
        .route("/health/alerts", get(alerts_handler))
        .route("/health/maintenance", post(maintenance_handler))
        .route("/health/alerts/clear", post(clear_alerts_handler))
        .route("/health/errors/reset", post(reset_errors_handler))
        .with_state(state)
}
