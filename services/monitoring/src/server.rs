//! `/metrics` and `/healthz` endpoints

use crate::error::MonitoringResult;
use crate::metrics::AgentMetrics;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::{SystemMode, SystemModeCell};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state of the endpoints
#[derive(Debug, Clone)]
pub struct MetricsState {
    /// Metric set to expose
    pub metrics: AgentMetrics,
    /// Mode reported by `/healthz`
    pub mode: Arc<SystemModeCell>,
}

async fn metrics(State(state): State<MetricsState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz(State(state): State<MetricsState>) -> Response {
    let mode = state.mode.get();
    let status = if mode == SystemMode::Exit {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "mode": mode.as_str() }))).into_response()
}

/// Router with both endpoints
pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_on(listener: TcpListener, state: MetricsState, cancel: CancellationToken) -> MonitoringResult<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Bind `addr` and serve until `cancel` fires
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn serve(addr: SocketAddr, state: MetricsState, cancel: CancellationToken) -> MonitoringResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    serve_on(listener, state, cancel).await
}
