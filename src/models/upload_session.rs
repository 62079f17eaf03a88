//! Upload session model for chunked uploads.
//!
//! This module defines the `UploadSession` entity that tracks the state
//! of a chunked upload: which chunk indices have been committed, the
//! declared geometry of the file, and the session lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// State of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no chunk committed yet
    Pending,
    /// At least one chunk committed
    Uploading,
    /// Every chunk committed; awaiting or undergoing assembly
    Completed,
    /// Failed by a worker or an administrator
    Failed,
}

impl SessionState {
    /// Convert to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from database string representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if the session can accept more chunks
    pub fn can_accept_chunks(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }

    /// Check if the session is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Upload session tracking one client's chunked upload of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier
    pub id: Uuid,

    /// Opaque id of the uploading user
    pub owner: String,

    /// Server-chosen storage name, `{uuid}{ext}` with the extension of the
    /// client filename
    pub target_filename: String,

    /// Client-supplied filename, preserved verbatim
    pub original_filename: String,

    /// Total bytes the client declared
    pub file_size: u64,

    /// Bytes per chunk as declared at init
    pub chunk_size: u64,

    /// Number of chunks, `ceil(file_size / chunk_size)`, computed once
    pub total_chunks: u64,

    /// Chunk indices successfully committed, each in `[0, total_chunks)`
    pub received: BTreeSet<u64>,

    /// Current session state
    pub state: SessionState,

    /// Client-supplied metadata (title, description, tags, category,
    /// mime_type, ...)
    pub metadata: BTreeMap<String, String>,

    /// Session creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,

    /// Expiration timestamp
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new upload session in state `Pending`
    pub fn new(
        owner: String,
        original_filename: String,
        file_size: u64,
        chunk_size: u64,
        ttl_seconds: u64,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_seconds as i64);
        let id = Uuid::new_v4();
        let target_filename = format!("{}{}", id, file_extension(&original_filename));

        Self {
            id,
            owner,
            target_filename,
            original_filename,
            file_size,
            chunk_size,
            total_chunks: file_size.div_ceil(chunk_size),
            received: BTreeSet::new(),
            state: SessionState::Pending,
            metadata,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    /// Check if all chunks have been committed
    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks
    }

    /// Check if the session has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Calculate upload progress as a percentage
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.received.len() as f64 / self.total_chunks as f64) * 100.0
    }

    /// Chunk indices not yet committed, in ascending order
    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Record a committed chunk and roll the state machine forward.
    ///
    /// Returns `true` when this call inserted the final index and the
    /// session just transitioned to `Completed`. Re-inserting an index the
    /// session already holds leaves the set and state unchanged.
    pub fn record_chunk(&mut self, chunk_index: u64) -> bool {
        debug_assert!(chunk_index < self.total_chunks);

        let inserted = self.received.insert(chunk_index);
        self.updated_at = Utc::now();

        if self.is_complete() {
            let newly_completed = self.state != SessionState::Completed;
            self.state = SessionState::Completed;
            inserted && newly_completed
        } else {
            self.state = SessionState::Uploading;
            false
        }
    }

    /// Mark session as failed
    pub fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.updated_at = Utc::now();
    }

    /// Mark session as pending again (used by resume)
    pub fn mark_pending(&mut self) {
        self.state = SessionState::Pending;
        self.updated_at = Utc::now();
    }

    /// Title to publish: explicit metadata title, else the original filename
    pub fn title(&self) -> String {
        self.metadata
            .get("title")
            .filter(|t| !t.is_empty())
            .cloned()
            .unwrap_or_else(|| self.original_filename.clone())
    }
}

/// Extension of a client filename including the leading dot, or empty
pub fn file_extension(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

// =============================================================================
// Request / response DTOs
// =============================================================================

/// Request DTO for initialising a chunked upload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    /// Original filename
    pub filename: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// Bytes per chunk
    pub chunk_size: u64,

    /// Opaque metadata map (title, description, tags, category, mime_type)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Response DTO for a created session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: Uuid,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub uploaded_chunks: u64,
}

impl InitUploadResponse {
    pub fn from_session(session: &UploadSession) -> Self {
        Self {
            session_id: session.id,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            uploaded_chunks: session.received.len() as u64,
        }
    }
}

/// Response DTO acknowledging a queued chunk
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQueuedResponse {
    pub session_id: Uuid,
    pub chunk_index: u64,
    pub status: &'static str,
}

/// Response DTO for session status polls
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub status: SessionState,
    /// Progress percentage in `[0, 100]`
    pub progress: f64,
}

impl SessionStatusResponse {
    pub fn from_session(session: &UploadSession) -> Self {
        Self {
            uploaded_chunks: session.received.len() as u64,
            total_chunks: session.total_chunks,
            status: session.state,
            progress: session.progress_percent(),
        }
    }
}

/// Response DTO for resume requests
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub missing_chunks: Vec<u64>,
    pub status: SessionState,
}

/// Response DTO for the session listing
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub page: usize,
    pub limit: usize,
}

/// One row in the session listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub original_filename: String,
    pub status: SessionState,
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_session(session: &UploadSession) -> Self {
        Self {
            session_id: session.id,
            original_filename: session.original_filename.clone(),
            status: session.state,
            uploaded_chunks: session.received.len() as u64,
            total_chunks: session.total_chunks,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}
