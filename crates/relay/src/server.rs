//! Liveness, readiness and Prometheus endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub symbols: usize,
    pub connected: bool,
}

#[derive(Clone)]
pub struct ServerState {
    pub symbols: usize,
    pub connected: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(symbols: usize, connected: Arc<AtomicBool>) -> Self {
        Self { symbols, connected }
    }
}

/// Always 200 while the process is up
async fn health() -> &'static str {
    "ok"
}

/// 200 only while the upstream feed is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<ReadyResponse>) {
    let connected = state.connected.load(Ordering::SeqCst);
    let status_code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadyResponse {
            status: if connected { "ready" } else { "not_ready" },
            symbols: state.symbols,
            connected,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");
    axum::serve(listener, app).await
}
