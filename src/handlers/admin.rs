//! Admin API handlers (local only).
//!
//! These endpoints are only accessible from localhost and provide
//! administrative functionality for moderating sessions and videos and
//! for operating the pipeline.
//!
//! ## Endpoints
//!
//! - `GET /admin/sessions/{id}` - Inspect an upload session
//! - `POST /admin/sessions/{id}/fail` - Mark a session failed
//! - `DELETE /admin/sessions/{id}` - Delete a session and its chunks
//! - `GET /admin/videos/{id}` - Get detailed video info
//! - `DELETE /admin/videos/{id}` - Delete a video and its blobs
//! - `GET /admin/stats` - Storage and queue statistics
//! - `POST /admin/gc` - Run a GC pass over expired sessions now
//!
//! ## Security
//!
//! The admin API is bound to 127.0.0.1 only and should never be
//! exposed to the public internet.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::video::VideoInfoResponse;
use crate::services::cache::ListingCache;
use crate::services::queue::QueueDepths;
use crate::state::AppState;

/// Inspect an upload session
///
/// GET /admin/sessions/{id}
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let session = state
        .sessions
        .get(id)?
        .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", id)))?;

    Ok(Json(serde_json::to_value(&session)?))
}

/// Mark a session failed
///
/// POST /admin/sessions/{id}/fail
async fn fail_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.mark_failed(id).await?;
    info!(session_id = %id, "Session marked failed by administrator");
    Ok(Json(serde_json::to_value(&session)?))
}

/// Delete a session, its chunks and its index key
///
/// DELETE /admin/sessions/{id}
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeleteResponse>)> {
    if !state.sessions.delete(id).await? {
        return Err(AppError::not_found(format!(
            "Upload session not found: {}",
            id
        )));
    }

    info!(session_id = %id, "Session deleted by administrator");

    Ok((
        StatusCode::OK,
        Json(DeleteResponse {
            success: true,
            message: format!("Session {} deleted successfully", id),
            id,
        }),
    ))
}

/// Get detailed video information
///
/// GET /admin/videos/{id}
async fn get_video_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VideoInfoResponse>> {
    let video = state
        .db
        .get_video(id)?
        .ok_or_else(|| AppError::not_found(format!("Video not found: {}", id)))?;

    Ok(Json(VideoInfoResponse::from_video(&video)))
}

/// Delete a video together with its original and thumbnail blobs
///
/// DELETE /admin/videos/{id}
///
/// This is used for content moderation (e.g., removing illegal content).
async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeleteResponse>)> {
    let video = state
        .db
        .get_video(id)?
        .ok_or_else(|| AppError::not_found(format!("Video not found: {}", id)))?;

    if let Err(e) = state.storage.delete(&video.storage_key).await {
        warn!(id = %id, error = %e, "Failed to delete video blob");
    }
    if !video.thumbnail_key.is_empty() {
        if let Err(e) = state.storage.delete(&video.thumbnail_key).await {
            warn!(id = %id, error = %e, "Failed to delete thumbnail blob");
        }
    }

    state.db.delete_video(id)?;
    state
        .cache
        .invalidate_prefix(&ListingCache::category_prefix(&video.category));

    info!(id = %id, title = %video.title, "Deleted video");

    Ok((
        StatusCode::OK,
        Json(DeleteResponse {
            success: true,
            message: format!("Video {} deleted successfully", id),
            id,
        }),
    ))
}

/// Delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
    pub id: Uuid,
}

/// Get storage and queue statistics
///
/// GET /admin/stats
async fn get_stats(State(state): State<AppState>) -> Result<Json<AdminStatsResponse>> {
    let storage = state.storage.stats().await?;
    let queues = state.bus.depths()?;

    Ok(Json(AdminStatsResponse {
        session_count: state.db.session_count()?,
        video_count: state.db.video_count()?,
        storage,
        queues,
    }))
}

/// Admin stats response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatsResponse {
    pub session_count: u64,
    pub video_count: u64,
    pub storage: crate::services::storage::StorageStats,
    pub queues: Vec<QueueDepths>,
}

/// Run a GC pass over expired sessions
///
/// POST /admin/gc
async fn run_gc(State(state): State<AppState>) -> Result<Json<GcResponse>> {
    let removed = state.sessions.gc_expired(Utc::now()).await?;
    let index_keys_purged = state.index.purge_expired();

    info!(
        sessions = removed.len(),
        index_keys = index_keys_purged,
        "Administrative GC pass completed"
    );

    Ok(Json(GcResponse {
        sessions_removed: removed,
        index_keys_purged,
    }))
}

/// GC response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcResponse {
    pub sessions_removed: Vec<Uuid>,
    pub index_keys_purged: usize,
}

/// Create admin routes
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/fail", post(fail_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/videos/{id}", get(get_video_info))
        .route("/videos/{id}", delete(delete_video))
        .route("/stats", get(get_stats))
        .route("/gc", post(run_gc))
}
