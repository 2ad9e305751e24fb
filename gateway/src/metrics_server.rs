//! HTTP server for Prometheus metrics
//!
//! Runs a lightweight HTTP server next to the pipeline for Prometheus
//! scraping. Nothing here touches stdout.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus text for everything in the registry
//! - `GET /health` - JSON health summary
//!
//! # Example
//!
//! ```ignore
//! use kaiku_gateway::MetricsServer;
//!
//! let runner = pipeline.build();
//! let handle = MetricsServer::start(config.metrics_addr, registry, Some(runner.bus().clone()));
//! ```

use crate::bus::EventBus;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    registry: Registry,
    bus: Option<Arc<EventBus>>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(addr: SocketAddr, registry: Registry, bus: Option<Arc<EventBus>>) -> JoinHandle<()> {
        let state = AppState { registry, bus };

        tokio::spawn(async move {
            let app = router(state);

            info!(%addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match crate::metrics::gather(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct HealthSummary {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_continuations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_misses: Option<u64>,
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = HealthSummary {
        status: "ok",
        pending_continuations: state.bus.as_ref().map(|bus| bus.pending_count()),
        correlation_misses: state.bus.as_ref().map(|bus| bus.misses()),
    };
    (StatusCode::OK, Json(summary))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::MetricsAggregator;

    async fn body_of(response: axum::response::Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 100_000)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let latency = MetricsAggregator::new();
        latency.record(0.1, &[("http_status", "200")]).unwrap();
        let state = AppState {
            registry: latency.registry().clone(),
            bus: None,
        };

        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));

        let body = body_of(response).await;
        assert!(body.contains("# HELP responses_latency_seconds_by_http_status Response time of replayed responses"));
    }

    #[tokio::test]
    async fn test_health_handler_without_bus() {
        let state = AppState {
            registry: Registry::new(),
            bus: None,
        };

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json.get("pending_continuations").is_none());
    }

    #[tokio::test]
    async fn test_health_handler_reports_bus() {
        let state = AppState {
            registry: Registry::new(),
            bus: Some(Arc::new(EventBus::new(Vec::new()))),
        };

        let response = health_handler(State(state)).await.into_response();
        let json: serde_json::Value = serde_json::from_str(&body_of(response).await).unwrap();

        assert_eq!(json["pending_continuations"], 0);
        assert_eq!(json["correlation_misses"], 0);
    }
}
