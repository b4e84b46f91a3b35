//! Admin server for health checks and metrics.
//!
//! Runs on its own port (default 8788) so probes and scrapes never share a
//! listener with client traffic:
//!
//! - `GET /health` - liveness (JSON, lifecycle-aware)
//! - `GET /ready` - readiness (JSON, per-check results)
//! - `GET /metrics` - OpenMetrics text from `prometheus-client`

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::registry::Registry;
use sessiongate_core::lifecycle::{LifecycleManager, health_router};
use sessiongate_core::telemetry::GatewayMetrics;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ports::admin_port;

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    /// Port to listen on (default: 8788)
    pub port: u16,
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: String,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: admin_port(),
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

impl AdminServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Shared state for the admin server.
#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<LifecycleManager>,
    pub prom_registry: Arc<Registry>,
    /// Gauges refreshed on every scrape.
    pub metrics: Option<Arc<GatewayMetrics>>,
}

pub struct AdminServer {
    config: AdminServerConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(lifecycle: Arc<LifecycleManager>, prom_registry: Arc<Registry>) -> Self {
        Self::with_config(lifecycle, prom_registry, AdminServerConfig::default())
    }

    pub fn with_config(
        lifecycle: Arc<LifecycleManager>,
        prom_registry: Arc<Registry>,
        config: AdminServerConfig,
    ) -> Self {
        Self {
            config,
            state: AdminState {
                lifecycle,
                prom_registry,
                metrics: None,
            },
        }
    }

    /// Refresh `uptime_seconds` from the lifecycle manager on each scrape.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    /// Health and readiness come from the core lifecycle router; `/metrics`
    /// is added here.
    pub fn router(&self) -> Router {
        let metrics_router = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone());

        health_router(self.state.lifecycle.clone()).merge(metrics_router)
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr).await?;

        info!(addr = %bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if let Some(metrics) = &state.metrics {
        metrics
            .uptime_seconds
            .set(i64::try_from(state.lifecycle.uptime_seconds()).unwrap_or(i64::MAX));
    }

    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.prom_registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serial_test::serial;
    use sessiongate_core::lifecycle::LifecycleConfig;
    use sessiongate_core::route::RouteClass;
    use tower::ServiceExt;

    fn lifecycle() -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(LifecycleConfig::default()))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let admin = AdminServer::with_config(
            lifecycle(),
            Arc::new(Registry::default()),
            AdminServerConfig::with_port(0),
        );

        let response = admin.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["uptime_seconds"].is_number());
    }

    #[tokio::test]
    async fn test_readiness_follows_lifecycle() {
        let lifecycle = lifecycle();
        let admin = AdminServer::with_config(
            lifecycle.clone(),
            Arc::new(Registry::default()),
            AdminServerConfig::with_port(0),
        );

        let response = admin.router().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        lifecycle.mark_config_loaded();
        lifecycle.mark_store_ready("memory");
        lifecycle.mark_ready();

        let response = admin.router().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["checks"]["config_loaded"], true);
        assert_eq!(json["checks"]["store_ready"], true);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_gateway_metrics() {
        let mut registry = Registry::default();
        let metrics = Arc::new(GatewayMetrics::new(&mut registry));
        metrics.record_request(RouteClass::Completion);
        metrics.record_auth_rejection();

        let admin = AdminServer::with_config(
            lifecycle(),
            Arc::new(registry),
            AdminServerConfig::with_port(0),
        )
        .with_metrics(metrics);

        let response = admin.router().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .contains("openmetrics")
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("sessiongate_requests_total"));
        assert!(text.contains("route=\"completion\""));
        assert!(text.contains("sessiongate_auth_rejections_total"));
        assert!(text.contains("sessiongate_uptime_seconds"));
    }

    #[test]
    #[serial]
    fn test_admin_config_default() {
        let config = AdminServerConfig::default();
        assert_eq!(config.port, 8788);
        assert_eq!(config.bind_string(), "127.0.0.1:8788");
    }
}
