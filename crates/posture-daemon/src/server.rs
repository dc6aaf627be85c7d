//! HTTP surface: event delivery and Prometheus scraping.
//!
//! - `POST /events`: one event envelope. `200` with per-finding outcomes,
//!   `400` when the envelope is undecodable, `503` when the sender should
//!   redeliver.
//! - `GET /metrics`: Prometheus text format.
//! - `GET /healthz`: liveness.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::services::Services;

/// Builds the router over `services`.
pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/",
            get(|| async {
                "posture-daemon\n\nPOST /events - deliver a finding event\nGET /metrics - Prometheus metrics endpoint\n"
            }),
        )
        .with_state(services)
}

/// Serves `router` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    services: Arc<Services>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP listener")?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, router(services))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

pub(crate) async fn events_handler(
    State(services): State<Arc<Services>>,
    Json(event): Json<Value>,
) -> Response {
    let engine = match services.engine() {
        Ok(engine) => engine,
        Err(e) => {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        },
    };
    match engine.process_raw_event(&event).await {
        Ok(outcomes) => {
            let body: Vec<Value> = outcomes
                .iter()
                .map(|o| match o {
                    posture_core::IngestionOutcome::Triggered { execution_id } => {
                        json!({ "outcome": o.kind(), "execution_id": execution_id })
                    },
                    _ => json!({ "outcome": o.kind() }),
                })
                .collect();
            (StatusCode::OK, Json(json!({ "outcomes": body }))).into_response()
        },
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "event deferred for redelivery");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        },
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

pub(crate) async fn metrics_handler(State(services): State<Arc<Services>>) -> Response {
    let Some(registry) = services.metrics() else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };
    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}
