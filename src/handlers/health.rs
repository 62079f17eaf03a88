//! Health check endpoints.
//!
//! Provides endpoints for monitoring server health and readiness.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server status
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
}

/// Liveness probe - server is running
///
/// GET /health/live
async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - server can accept requests
///
/// GET /health/ready
async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    // Check database connectivity
    let db_ok = state.db.session_count().is_ok();
    let index_ok = state.index.is_available();

    let status = if db_ok { "ready" } else { "not_ready" };

    Json(ReadinessResponse {
        status,
        database: if db_ok { "connected" } else { "disconnected" },
        chunk_index: if index_ok { "available" } else { "degraded" },
    })
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: &'static str,
    /// The ingest path degrades to the database fallback without the index
    pub chunk_index: &'static str,
}

/// Storage stats endpoint
///
/// GET /health/stats
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let storage_stats = state.storage.stats().await.ok();
    let video_count = state.db.video_count().unwrap_or(0);
    let session_count = state.db.session_count().unwrap_or(0);

    Json(StatsResponse {
        video_count,
        session_count,
        storage: storage_stats,
    })
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub video_count: u64,
    pub session_count: u64,
    pub storage: Option<crate::services::storage::StorageStats>,
}

/// Create health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .route("/stats", get(stats))
}
