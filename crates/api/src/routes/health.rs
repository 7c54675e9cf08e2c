use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Configured worker count.
    pub workers: usize,
    /// Sessions that have not yet settled.
    pub live_sessions: usize,
}

/// GET /health -- returns service status and dispatch load.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let live_sessions = state.coordinator.sessions().live_count().await;

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: state.coordinator.workers().len(),
        live_sessions,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
