//! Upload handlers for the chunked ingestion pipeline.
//!
//! ## Endpoints
//!
//! - `POST /upload/initialize` - Create an upload session
//! - `POST /upload/chunk` - Submit one chunk (multipart)
//! - `GET /upload/status/{id}` - Poll session progress
//! - `POST /upload/resume/{id}` - List missing chunks for resumption
//! - `DELETE /upload/cancel/{id}` - Cancel an in-flight upload
//! - `GET /upload/sessions` - List the caller's sessions
//!
//! The chunk endpoint only accepts the payload and queues commit work; a
//! 200 means "queued", not "committed". Clients poll the status endpoint
//! to learn what has actually been recorded.
//!
//! # Example
//!
//! ```bash
//! # 1. Initialize
//! curl -X POST http://localhost:3000/upload/initialize \
//!   -H "X-User-Id: user-1" -H "Content-Type: application/json" \
//!   -d '{"filename": "clip.mp4", "fileSize": 2621440, "chunkSize": 1048576, "metadata": {}}'
//!
//! # 2. Upload chunks
//! curl -X POST http://localhost:3000/upload/chunk \
//!   -H "X-User-Id: user-1" \
//!   -F "sessionId={id}" -F "chunkIndex=0" -F "chunk=@clip.part0"
//!
//! # 3. Poll
//! curl http://localhost:3000/upload/status/{id} -H "X-User-Id: user-1"
//! ```

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::middleware::Caller;
use crate::models::upload_session::{
    ChunkQueuedResponse, InitUploadRequest, InitUploadResponse, ResumeResponse,
    SessionListResponse, SessionStatusResponse, SessionSummary, UploadSession,
};
use crate::models::Job;
use crate::services::cache::ListingCache;
use crate::services::CHUNK_PIPELINE;
use crate::state::AppState;

// =============================================================================
// Session lifecycle endpoints
// =============================================================================

/// Initialize a chunked upload session
///
/// POST /upload/initialize
async fn initialize_upload(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<InitUploadRequest>,
) -> Result<(StatusCode, Json<InitUploadResponse>)> {
    let session = state.sessions.init(
        caller.user_id,
        request.filename,
        request.file_size,
        request.chunk_size,
        request.metadata,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(InitUploadResponse::from_session(&session)),
    ))
}

/// Accept one chunk and queue its commit
///
/// POST /upload/chunk
///
/// Multipart fields: `sessionId`, `chunkIndex`, then `chunk`. The text
/// fields must precede the payload so the request can be authorised
/// before any bytes hit the store.
async fn upload_chunk(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<Json<ChunkQueuedResponse>> {
    let mut session_id: Option<Uuid> = None;
    let mut chunk_index: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::invalid_input(format!("Invalid multipart data: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "sessionId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_input(format!("Invalid sessionId: {}", e)))?;
                session_id = Some(Uuid::parse_str(text.trim())?);
            }
            "chunkIndex" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_input(format!("Invalid chunkIndex: {}", e)))?;
                chunk_index = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| AppError::invalid_input("chunkIndex must be an integer"))?,
                );
            }
            "chunk" => {
                let session_id = session_id.ok_or_else(|| {
                    AppError::invalid_input("sessionId must precede the chunk part")
                })?;
                let chunk_index = chunk_index.ok_or_else(|| {
                    AppError::invalid_input("chunkIndex must precede the chunk part")
                })?;

                let session = authorize_chunk(&state, session_id, chunk_index, &caller)?;
                return accept_chunk(state, session, chunk_index, field).await;
            }
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    Err(AppError::invalid_input(
        "No chunk field found in multipart request",
    ))
}

/// Authorise a chunk submission against its session
fn authorize_chunk(
    state: &AppState,
    session_id: Uuid,
    chunk_index: u64,
    caller: &Caller,
) -> Result<UploadSession> {
    let session = state
        .sessions
        .get(session_id)?
        .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", session_id)))?;

    if session.owner != caller.user_id {
        return Err(AppError::forbidden("session belongs to another user"));
    }

    if !session.state.can_accept_chunks() {
        return Err(AppError::conflict(format!(
            "Session {} is not accepting chunks (state: {})",
            session_id,
            session.state.as_str()
        )));
    }

    if session.is_expired() {
        return Err(AppError::conflict("upload session has expired"));
    }

    if chunk_index >= session.total_chunks {
        return Err(AppError::invalid_input(format!(
            "Chunk index {} out of range for {} chunks",
            chunk_index, session.total_chunks
        )));
    }

    Ok(session)
}

/// Stream the chunk part to a temp blob and enqueue the commit
async fn accept_chunk(
    state: AppState,
    session: UploadSession,
    chunk_index: u64,
    mut field: axum::extract::multipart::Field<'_>,
) -> Result<Json<ChunkQueuedResponse>> {
    let temp_key = format!(
        "chunks/temp_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().as_simple()
    );

    let max_chunk_size = state.max_chunk_size();
    let mut writer = state.storage.create(&temp_key).await?;

    loop {
        let piece = match field.chunk().await {
            Ok(Some(piece)) => piece,
            Ok(None) => break,
            Err(e) => {
                writer.abort().await?;
                return Err(AppError::invalid_input(format!(
                    "Failed to read chunk part: {}",
                    e
                )));
            }
        };

        if writer.written() + piece.len() as u64 > max_chunk_size {
            writer.abort().await?;
            return Err(AppError::payload_too_large(format!(
                "Chunk exceeds the maximum part size of {} bytes",
                max_chunk_size
            )));
        }

        writer.write_all(&piece).await?;
    }

    let size = writer.finish().await?;

    // The commit is asynchronous; a queue failure means the chunk was never
    // queued, so the temp blob must not leak
    let job = Job::CommitChunk {
        session_id: session.id,
        chunk_index,
        temp_key: temp_key.clone(),
        owner: session.owner.clone(),
    };

    if let Err(e) = state.bus.submit(CHUNK_PIPELINE, job) {
        warn!(session_id = %session.id, error = %e, "Failed to enqueue chunk commit");
        state.storage.delete(&temp_key).await?;
        return Err(AppError::transient("chunk queue unavailable"));
    }

    info!(
        session_id = %session.id,
        chunk_index = chunk_index,
        size = size,
        "Chunk queued for commit"
    );

    Ok(Json(ChunkQueuedResponse {
        session_id: session.id,
        chunk_index,
        status: "queued",
    }))
}

/// Get upload session status
///
/// GET /upload/status/{id}
async fn upload_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatusResponse>> {
    let session = owned_session(&state, session_id, &caller)?;
    Ok(Json(SessionStatusResponse::from_session(&session)))
}

/// List missing chunks so an interrupted client can resume
///
/// POST /upload/resume/{id}
async fn resume_upload(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ResumeResponse>> {
    owned_session(&state, session_id, &caller)?;

    let outcome = state.sessions.resume(session_id).await?;
    Ok(Json(ResumeResponse {
        missing_chunks: outcome.missing_chunks,
        status: outcome.state,
    }))
}

/// Cancel an upload: chunks and session are removed
///
/// DELETE /upload/cancel/{id}
async fn cancel_upload(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode> {
    owned_session(&state, session_id, &caller)?;

    state.sessions.cancel(session_id).await?;
    info!(session_id = %session_id, "Upload cancelled");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

/// List the caller's sessions, paged
///
/// GET /upload/sessions?page&limit
async fn list_sessions(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>> {
    let page = query.page.max(1);
    let limit = query.limit.clamp(1, 100);

    let cache_key = ListingCache::sessions_key(&caller.user_id, page, limit);
    if let Some(cached) = state.cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let sessions = state.sessions.list_by_owner(&caller.user_id, page, limit)?;
    let response = SessionListResponse {
        sessions: sessions.iter().map(SessionSummary::from_session).collect(),
        page,
        limit,
    };

    let body = serde_json::to_value(&response)?;
    state.cache.put(&cache_key, body.clone());

    Ok(Json(body))
}

/// Fetch a session and check it belongs to the caller
fn owned_session(state: &AppState, session_id: Uuid, caller: &Caller) -> Result<UploadSession> {
    let session = state
        .sessions
        .get(session_id)?
        .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", session_id)))?;

    if session.owner != caller.user_id {
        return Err(AppError::forbidden("session belongs to another user"));
    }

    Ok(session)
}

/// Create upload routes.
///
/// Only the chunk intake route sits behind the rate limiter; status polls
/// and session management stay unthrottled so a backed-off client can
/// still observe its progress.
pub fn upload_routes(rate_limiter: &crate::middleware::RateLimiter) -> Router<AppState> {
    let intake = Router::new()
        .route("/chunk", post(upload_chunk))
        .route_layer(rate_limiter.layer());

    Router::new()
        .route("/initialize", post(initialize_upload))
        .route("/status/{id}", get(upload_status))
        .route("/resume/{id}", post(resume_upload))
        .route("/cancel/{id}", delete(cancel_upload))
        .route("/sessions", get(list_sessions))
        .merge(intake)
}
