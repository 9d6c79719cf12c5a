use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::facade::Monitor;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(monitor)
}

async fn api_status(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    Json(monitor.status().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(monitor: Arc<Monitor>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status endpoint listening");

    axum::serve(listener, router(monitor))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
