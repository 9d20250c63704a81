//! Health & Status API endpoints
//!
//! - GET /health  - Liveness probe
//! - GET /status  - Per-chain loop status and uptime (JSON)
//! - GET /metrics - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::health::{ChainHealth, ChainStatus, RoleSnapshot};
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<ChainHealth>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// "ok", or "degraded" while any loop is alarming or dead
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub chains: Vec<RoleSnapshot>,
}

async fn liveness() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let chains = state.health.snapshot();
    let degraded = chains
        .iter()
        .any(|c| matches!(c.status, ChainStatus::Alarming | ChainStatus::Dead));
    Json(StatusResponse {
        status: if degraded { "degraded" } else { "ok" },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        chains,
    })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn router(health: Arc<ChainHealth>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(AppState {
            health,
            started_at: Instant::now(),
        })
}

/// Serve the API until the listener fails
pub async fn start_api_server(addr: SocketAddr, health: Arc<ChainHealth>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(health)).await?;
    Ok(())
}
