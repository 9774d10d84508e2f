//! Route handlers.

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};

use super::server::ApiState;
use crate::executor::Execution;
use crate::metrics::{HealthStatus, MetricsSnapshot};
use crate::resilience::CircuitBreakerSnapshot;
use crate::scheduler::{SchedulerState, SchedulerStatus};

/// Executions returned by `/executions` when no limit is given.
const DEFAULT_EXECUTIONS_LIMIT: usize = 20;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/status", get(status))
        .route("/executions", get(executions))
        .route("/metrics", get(metrics))
}

/// Full health report. 503 when the process is unhealthy.
async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let health = state.scheduler.health().check_all().await;
    let code = if health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(health))
}

async fn liveness_check(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": state.start_time.elapsed().as_secs()
        })),
    )
}

/// Ready while the loop is running and the last health report allows it.
async fn readiness_check(State(state): State<ApiState>) -> impl IntoResponse {
    let running = state.scheduler.state() == SchedulerState::Running;
    let healthy = state
        .scheduler
        .health()
        .last_report()
        .is_none_or(|report| report.is_ready());

    if running && healthy {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: SchedulerStatus,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub metrics: MetricsSnapshot,
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.scheduler.status(),
        circuit_breaker: state.scheduler.circuit_breaker().map(|b| b.snapshot()),
        metrics: state.scheduler.metrics().snapshot(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<usize>,
}

/// Newest executions, oldest first.
async fn executions(
    State(state): State<ApiState>,
    Query(query): Query<ExecutionsQuery>,
) -> Json<Vec<Execution>> {
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTIONS_LIMIT);
    Json(state.scheduler.recent_executions(limit))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.exporter.export(),
    )
}
