//! Upload session manager.
//!
//! Owns the session state machine and is the only writer of
//! chunk-received facts. The hot path, `record_chunk`, runs through the
//! chunk index when it is available and falls back to a serialised
//! database update when it is not; the fallback is correct standalone,
//! the index is an accelerator only.
//!
//! State machine:
//!
//! ```text
//! pending ──first record_chunk──▶ uploading ──last record_chunk──▶ completed
//!    │                               │
//!    └──mark_failed──▶ failed ◀──────┘
//!    completed ──assembly success──▶ (session deleted)
//! ```

use crate::error::{AppError, Result};
use crate::models::upload_session::file_extension;
use crate::models::{SessionState, UploadSession};
use crate::services::cache::ListingCache;
use crate::services::chunk_index::ChunkIndex;
use crate::services::database::MetadataStore;
use crate::services::storage::BlobStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum declared file size: 5 GiB
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Result of a resume call
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub missing_chunks: Vec<u64>,
    pub state: SessionState,
}

/// Session manager owning the upload state machine
#[derive(Debug, Clone)]
pub struct SessionManager {
    db: MetadataStore,
    index: ChunkIndex,
    store: BlobStore,
    cache: ListingCache,
    max_file_size: u64,
    max_chunk_size: u64,
    session_ttl_seconds: u64,
}

impl SessionManager {
    pub fn new(
        db: MetadataStore,
        index: ChunkIndex,
        store: BlobStore,
        cache: ListingCache,
        max_file_size: u64,
        max_chunk_size: u64,
        session_ttl_seconds: u64,
    ) -> Self {
        Self {
            db,
            index,
            store,
            cache,
            max_file_size: max_file_size.min(MAX_FILE_SIZE),
            max_chunk_size,
            session_ttl_seconds,
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Initialise a new upload session in state `pending`
    pub fn init(
        &self,
        owner: String,
        original_filename: String,
        file_size: u64,
        chunk_size: u64,
        metadata: BTreeMap<String, String>,
    ) -> Result<UploadSession> {
        if file_size == 0 {
            return Err(AppError::invalid_input("fileSize must be at least 1 byte"));
        }
        if file_size > self.max_file_size {
            return Err(AppError::invalid_input(format!(
                "fileSize {} exceeds the maximum of {} bytes",
                file_size, self.max_file_size
            )));
        }
        if chunk_size == 0 {
            return Err(AppError::invalid_input("chunkSize must be at least 1 byte"));
        }
        if chunk_size > self.max_chunk_size {
            return Err(AppError::invalid_input(format!(
                "chunkSize {} exceeds the maximum of {} bytes",
                chunk_size, self.max_chunk_size
            )));
        }
        if original_filename.is_empty() {
            return Err(AppError::invalid_input("filename must not be empty"));
        }

        let session = UploadSession::new(
            owner,
            original_filename,
            file_size,
            chunk_size,
            self.session_ttl_seconds,
            metadata,
        );
        self.db.create_session(&session)?;
        self.cache
            .invalidate_prefix(&ListingCache::sessions_prefix(&session.owner));

        info!(
            session_id = %session.id,
            owner = %session.owner,
            file_size = session.file_size,
            total_chunks = session.total_chunks,
            ext = %file_extension(&session.original_filename),
            "Created upload session"
        );

        Ok(session)
    }

    /// Record a committed chunk. THE hot path.
    ///
    /// Adds `chunk_index` to the session's received set and rolls the
    /// state machine forward; returns the post-image. Safe under parallel
    /// callers on the same session, and idempotent: redelivery of an index
    /// already held returns the current image unchanged.
    pub async fn record_chunk(&self, session_id: Uuid, chunk_index: u64) -> Result<UploadSession> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", session_id)))?;

        // Terminal sessions no-op: the caller gets the current image
        if session.state.is_terminal() {
            return Ok(session);
        }

        if chunk_index >= session.total_chunks {
            return Err(AppError::invalid_input(format!(
                "Chunk index {} out of range for {} chunks",
                chunk_index, session.total_chunks
            )));
        }

        // Fast path through the chunk index; any index error restarts with
        // the serialised database fallback
        let members = match self.index_members(&session, chunk_index) {
            Ok(members) => Some(members),
            Err(_) => {
                debug!(session_id = %session_id, "Chunk index unavailable, using database fallback");
                None
            }
        };

        let updated = self
            .db
            .update_session(session_id, move |s| {
                if s.state.is_terminal() {
                    return Ok(());
                }
                match members {
                    Some(members) => {
                        // The write is the full set derived from the index,
                        // merged with what the row already holds
                        s.received.extend(members);
                        s.state = if s.is_complete() {
                            SessionState::Completed
                        } else {
                            SessionState::Uploading
                        };
                        s.updated_at = Utc::now();
                    }
                    None => {
                        s.record_chunk(chunk_index);
                    }
                }
                Ok(())
            })
            .await?;

        if updated.state == SessionState::Completed {
            // Best effort: the authoritative set lives in the database now
            let _ = self.index.del(session_id);
            info!(
                session_id = %session_id,
                total_chunks = updated.total_chunks,
                "Upload session completed"
            );
        }

        Ok(updated)
    }

    /// Run the index side of `record_chunk`, returning the sorted member
    /// set after the add.
    ///
    /// A restarted process starts with an empty index while the session
    /// row already holds received chunks, so an empty key is seeded from
    /// the row before the add.
    fn index_members(
        &self,
        session: &UploadSession,
        chunk_index: u64,
    ) -> std::result::Result<Vec<u64>, crate::services::chunk_index::IndexUnavailable> {
        if self.index.scard(session.id)? == 0 && !session.received.is_empty() {
            for index in &session.received {
                self.index.sadd(session.id, *index)?;
            }
        }

        self.index.sadd(session.id, chunk_index)?;
        self.index.expire(session.id)?;
        self.index.smembers(session.id)
    }

    /// Mark a session failed (worker contradiction or administrator)
    pub async fn mark_failed(&self, session_id: Uuid) -> Result<UploadSession> {
        self.db
            .update_session(session_id, |s| {
                if s.state == SessionState::Completed {
                    return Err(AppError::conflict(
                        "completed sessions cannot be marked failed",
                    ));
                }
                s.mark_failed();
                Ok(())
            })
            .await
    }

    /// Put a failed session back to `pending` (used by resume)
    pub async fn mark_pending(&self, session_id: Uuid) -> Result<UploadSession> {
        self.db
            .update_session(session_id, |s| {
                if s.state == SessionState::Completed {
                    return Err(AppError::conflict("completed sessions cannot be reopened"));
                }
                s.mark_pending();
                Ok(())
            })
            .await
    }

    /// Get a session by id
    pub fn get(&self, session_id: Uuid) -> Result<Option<UploadSession>> {
        self.db.get_session(session_id)
    }

    /// List an owner's sessions, newest first
    pub fn list_by_owner(
        &self,
        owner: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<UploadSession>> {
        self.db.list_sessions_by_owner(owner, page, limit)
    }

    /// Report the chunks still missing; reopens a failed session.
    ///
    /// Completed sessions cannot be resumed.
    pub async fn resume(&self, session_id: Uuid) -> Result<ResumeOutcome> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", session_id)))?;

        if session.state == SessionState::Completed {
            return Err(AppError::invalid_input("upload is already complete"));
        }

        let session = if session.state == SessionState::Failed {
            self.mark_pending(session_id).await?
        } else {
            session
        };

        Ok(ResumeOutcome {
            missing_chunks: session.missing_chunks(),
            state: session.state,
        })
    }

    /// Delete a session row together with its chunk blobs and index key
    pub async fn delete(&self, session_id: Uuid) -> Result<bool> {
        let session = match self.db.get_session(session_id)? {
            Some(s) => s,
            None => return Ok(false),
        };

        let _ = self.index.del(session_id);
        self.store.delete_session_chunks(session_id).await?;
        self.db.delete_session(session_id)?;
        self.cache
            .invalidate_prefix(&ListingCache::sessions_prefix(&session.owner));

        info!(session_id = %session_id, "Deleted upload session");
        Ok(true)
    }

    /// Cancel an in-flight upload: chunks, index key and row all go away.
    ///
    /// Commit messages arriving after cancellation observe `NotFound` and
    /// are dropped by the worker.
    pub async fn cancel(&self, session_id: Uuid) -> Result<()> {
        if !self.delete(session_id).await? {
            return Err(AppError::not_found(format!(
                "Upload session not found: {}",
                session_id
            )));
        }
        Ok(())
    }

    /// Sessions past their expiry that are not completed
    pub fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        self.db.find_expired_sessions(now)
    }

    /// Garbage-collect expired sessions, returning the ids removed
    pub async fn gc_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let expired = self.find_expired(now)?;
        let mut removed = Vec::with_capacity(expired.len());

        for session in expired {
            match self.delete(session.id).await {
                Ok(_) => removed.push(session.id),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to GC expired session")
                }
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Garbage-collected expired upload sessions");
        }

        Ok(removed)
    }
}
