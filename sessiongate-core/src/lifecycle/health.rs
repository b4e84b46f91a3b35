//! Health and readiness probe handlers.
//!
//! - `/health` (liveness): 200 while the process is alive
//! - `/ready` (readiness): 200 only when every check passes
//!
//! | Endpoint | Condition | Status |
//! |----------|-----------|--------|
//! | /health  | Process alive | 200 |
//! | /health  | Stopped | 503 |
//! | /ready   | All checks pass | 200 |
//! | /ready   | Any check fails | 503 |
//! | /ready   | Shutting down | 503 |

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;

use super::{LifecycleManager, LifecycleState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct UnhealthyResponse {
    pub status: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    /// Gateway configuration parsed and validated
    pub config_loaded: bool,
    /// Session store connected
    pub store_ready: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.config_loaded && self.store_ready
    }

    /// Name of the first failing check.
    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        if !self.config_loaded {
            Some("config_loaded")
        } else if !self.store_ready {
            Some("store_ready")
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// "ready" or "not_ready"
    pub status: &'static str,
    pub checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Router with `GET /health` and `GET /ready`.
pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(lifecycle)
}

async fn health_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    if matches!(lifecycle.state(), LifecycleState::Stopped) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(UnhealthyResponse {
                status: "unhealthy",
                reason: "service_stopped".to_string(),
            }),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
        }),
    )
        .into_response()
}

async fn readiness_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let checks = lifecycle.readiness_checks();

    if lifecycle.is_shutting_down() {
        return not_ready(checks, Some("shutting_down".to_string()));
    }

    if checks.all_pass() && lifecycle.is_ready() {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                checks,
                reason: None,
            }),
        )
            .into_response();
    }

    let reason = match checks.first_failure() {
        Some(failed) => Some(failed.to_string()),
        None => Some(format!("lifecycle_state: {}", lifecycle.state())),
    };
    not_ready(checks, reason)
}

fn not_ready(checks: ReadinessChecks, reason: Option<String>) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            checks,
            reason,
        }),
    )
        .into_response()
}
