//! Metadata store using RocksDB.
//!
//! RocksDB provides crash safety through its LSM-tree architecture and
//! write-ahead log (WAL). All writes are atomic and durable.
//!
//! # Data Organization
//!
//! Uses column families to separate data types:
//! - `sessions`: Upload sessions (key: UUID)
//! - `session_expires`: Expiration index (key: timestamp:uuid)
//! - `videos`: Video records (key: UUID)
//! - `jobs`: Work bus envelopes (managed by the queue service)
//!
//! `update_session` serialises concurrent writers of the same row behind a
//! per-row async lock; the mutator sees the current image and may reject
//! the mutation with `Conflict`.

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use crate::models::{SessionState, UploadSession, Video, VideoState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) type DB = DBWithThreadMode<MultiThreaded>;

/// Column family names
const CF_SESSIONS: &str = "sessions";
const CF_SESSION_EXPIRES: &str = "session_expires";
const CF_VIDEOS: &str = "videos";
pub(crate) const CF_JOBS: &str = "jobs";

/// Metadata store for sessions and video assets
///
/// Uses RocksDB for high performance and crash safety.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<DB>,
    row_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    db_path: PathBuf,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.db_path)
            .finish()
    }
}

impl MetadataStore {
    /// Create a new metadata store
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let db_path = config.data_dir.join("rocksdb");

        // Ensure directory exists
        std::fs::create_dir_all(&db_path)?;

        // Configure RocksDB options
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Performance tuning
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(3);
        opts.set_max_total_wal_size(64 * 1024 * 1024); // 64MB
        opts.set_write_buffer_size(32 * 1024 * 1024); // 32MB
        opts.set_max_write_buffer_number(3);

        // Define column families
        let cf_names = [CF_SESSIONS, CF_SESSION_EXPIRES, CF_VIDEOS, CF_JOBS];
        let cf_descriptors: Vec<_> = cf_names
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        // Open database with column families
        let db = DB::open_cf_descriptors(&opts, &db_path, cf_descriptors)
            .map_err(|e| AppError::internal(format!("Failed to open RocksDB: {}", e)))?;

        info!(path = %db_path.display(), "Metadata store initialized (RocksDB)");

        Ok(Self {
            db: Arc::new(db),
            row_locks: Arc::new(DashMap::new()),
            db_path,
        })
    }

    /// Shared database handle for sibling services (work bus durability)
    pub(crate) fn raw_db(&self) -> Arc<DB> {
        Arc::clone(&self.db)
    }

    fn cf_sessions(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_SESSIONS)
            .expect("CF sessions must exist")
    }

    fn cf_session_expires(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_SESSION_EXPIRES)
            .expect("CF session_expires must exist")
    }

    fn cf_videos(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db.cf_handle(CF_VIDEOS).expect("CF videos must exist")
    }

    fn row_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Upload session operations
    // =========================================================================

    /// Insert a new upload session
    pub fn create_session(&self, session: &UploadSession) -> Result<()> {
        let record = SessionRecord::from(session);
        let data = serde_json::to_vec(&record)?;

        // Create expiration index key: "timestamp:uuid"
        let expires_key = format!("{}:{}", session.expires_at.to_rfc3339(), session.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf_sessions(), session.id.to_string().as_bytes(), &data);
        batch.put_cf(
            &self.cf_session_expires(),
            expires_key.as_bytes(),
            session.id.to_string().as_bytes(),
        );

        self.db
            .write(batch)
            .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

        debug!(id = %session.id, "Inserted upload session");
        Ok(())
    }

    /// Get an upload session by ID
    pub fn get_session(&self, id: Uuid) -> Result<Option<UploadSession>> {
        let key = id.to_string();
        match self
            .db
            .get_cf(&self.cf_sessions(), key.as_bytes())
            .map_err(|e| AppError::transient(format!("RocksDB read failed: {}", e)))?
        {
            Some(data) => {
                let record: SessionRecord = serde_json::from_slice(&data)?;
                Ok(Some(record.into_session()?))
            }
            None => Ok(None),
        }
    }

    /// Update a session under its row lock.
    ///
    /// The mutator sees the current image and may change `received` and
    /// `state`; returning an error aborts the update. The post-image is
    /// written back atomically and returned.
    pub async fn update_session<F>(&self, id: Uuid, mutator: F) -> Result<UploadSession>
    where
        F: FnOnce(&mut UploadSession) -> Result<()>,
    {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let mut session = self
            .get_session(id)?
            .ok_or_else(|| AppError::not_found(format!("Upload session not found: {}", id)))?;

        mutator(&mut session)?;
        self.put_session(&session)?;

        Ok(session)
    }

    /// Write a session image without mutator plumbing; callers must hold no
    /// expectations about concurrent writers (the full-set write is
    /// last-writer-wins). The expiration index follows an `expires_at`
    /// change.
    pub fn put_session(&self, session: &UploadSession) -> Result<()> {
        let old_session = self.get_session(session.id)?;

        let record = SessionRecord::from(session);
        let data = serde_json::to_vec(&record)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf_sessions(), session.id.to_string().as_bytes(), &data);

        if let Some(old) = old_session {
            if old.expires_at != session.expires_at {
                let old_expires_key =
                    format!("{}:{}", old.expires_at.to_rfc3339(), session.id);
                batch.delete_cf(&self.cf_session_expires(), old_expires_key.as_bytes());

                let new_expires_key =
                    format!("{}:{}", session.expires_at.to_rfc3339(), session.id);
                batch.put_cf(
                    &self.cf_session_expires(),
                    new_expires_key.as_bytes(),
                    session.id.to_string().as_bytes(),
                );
            }
        }

        self.db
            .write(batch)
            .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

        debug!(id = %session.id, state = session.state.as_str(), "Updated upload session");
        Ok(())
    }

    /// Delete an upload session, returning whether it existed
    pub fn delete_session(&self, id: Uuid) -> Result<bool> {
        // Get session to find expiration key
        let session = match self.get_session(id)? {
            Some(s) => s,
            None => return Ok(false),
        };

        let expires_key = format!("{}:{}", session.expires_at.to_rfc3339(), id);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf_sessions(), id.to_string().as_bytes());
        batch.delete_cf(&self.cf_session_expires(), expires_key.as_bytes());

        self.db
            .write(batch)
            .map_err(|e| AppError::transient(format!("RocksDB delete failed: {}", e)))?;

        self.row_locks.remove(&id);

        Ok(true)
    }

    /// Sessions whose `expires_at` has passed and which are not completed.
    ///
    /// Scans the expiration index; the `timestamp:uuid` key shape makes the
    /// scan stop at the first non-expired entry.
    pub fn find_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        let now = now.to_rfc3339();
        let mut expired = Vec::new();

        let iter = self
            .db
            .iterator_cf(&self.cf_session_expires(), rocksdb::IteratorMode::Start);

        for item in iter {
            let (key, value) =
                item.map_err(|e| AppError::transient(format!("RocksDB iterator error: {}", e)))?;

            let key_str = String::from_utf8_lossy(&key);

            // Key format: "timestamp:uuid"; keys sort lexically by timestamp
            if key_str.as_ref() > now.as_str() {
                break;
            }

            let id_str = String::from_utf8_lossy(&value);
            if let Ok(id) = Uuid::parse_str(&id_str) {
                if let Some(session) = self.get_session(id)? {
                    if session.state != SessionState::Completed {
                        expired.push(session);
                    }
                } else {
                    // Stale index entry for a deleted session
                    self.db
                        .delete_cf(&self.cf_session_expires(), key.as_ref())
                        .ok();
                }
            }
        }

        Ok(expired)
    }

    /// List sessions belonging to an owner, newest first, paged
    pub fn list_sessions_by_owner(
        &self,
        owner: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let iter = self
            .db
            .iterator_cf(&self.cf_sessions(), rocksdb::IteratorMode::Start);

        for item in iter {
            let (_, data) =
                item.map_err(|e| AppError::transient(format!("RocksDB iterator error: {}", e)))?;
            let record: SessionRecord = serde_json::from_slice(&data)?;
            let session = record.into_session()?;
            if session.owner == owner {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(sessions
            .into_iter()
            .skip(page.saturating_sub(1) * limit)
            .take(limit)
            .collect())
    }

    /// Count all sessions (health/stats)
    pub fn session_count(&self) -> Result<u64> {
        self.count_cf(&self.cf_sessions())
    }

    // =========================================================================
    // Video operations
    // =========================================================================

    /// Insert a new video record
    pub fn create_video(&self, video: &Video) -> Result<()> {
        let record = VideoRecord::from(video);
        let data = serde_json::to_vec(&record)?;

        self.db
            .put_cf(&self.cf_videos(), video.id.to_string().as_bytes(), data)
            .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

        debug!(id = %video.id, "Inserted video record");
        Ok(())
    }

    /// Get a video record by ID
    pub fn get_video(&self, id: Uuid) -> Result<Option<Video>> {
        let key = id.to_string();
        match self
            .db
            .get_cf(&self.cf_videos(), key.as_bytes())
            .map_err(|e| AppError::transient(format!("RocksDB read failed: {}", e)))?
        {
            Some(data) => {
                let record: VideoRecord = serde_json::from_slice(&data)?;
                Ok(Some(record.into_video()?))
            }
            None => Ok(None),
        }
    }

    /// Patch a video record under its row lock, returning the post-image
    pub async fn update_video<F>(&self, id: Uuid, patch: F) -> Result<Video>
    where
        F: FnOnce(&mut Video),
    {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let mut video = self
            .get_video(id)?
            .ok_or_else(|| AppError::not_found(format!("Video not found: {}", id)))?;

        patch(&mut video);

        let record = VideoRecord::from(&video);
        let data = serde_json::to_vec(&record)?;
        self.db
            .put_cf(&self.cf_videos(), id.to_string().as_bytes(), data)
            .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

        Ok(video)
    }

    /// Delete a video record, returning whether it existed
    pub fn delete_video(&self, id: Uuid) -> Result<bool> {
        if self.get_video(id)?.is_none() {
            return Ok(false);
        }

        self.db
            .delete_cf(&self.cf_videos(), id.to_string().as_bytes())
            .map_err(|e| AppError::transient(format!("RocksDB delete failed: {}", e)))?;

        debug!(id = %id, "Deleted video record");
        Ok(true)
    }

    /// Count all videos (health/stats)
    pub fn video_count(&self) -> Result<u64> {
        self.count_cf(&self.cf_videos())
    }

    fn count_cf(&self, cf: &Arc<rocksdb::BoundColumnFamily<'_>>) -> Result<u64> {
        let mut count = 0u64;
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        for item in iter {
            if item.is_ok() {
                count += 1;
            }
        }

        Ok(count)
    }
}

// =============================================================================
// Serialization structs
// =============================================================================

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    owner: String,
    target_filename: String,
    original_filename: String,
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
    received: Vec<u64>,
    state: String,
    metadata: BTreeMap<String, String>,
    created_at: String,
    updated_at: String,
    expires_at: String,
}

impl From<&UploadSession> for SessionRecord {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id.to_string(),
            owner: session.owner.clone(),
            target_filename: session.target_filename.clone(),
            original_filename: session.original_filename.clone(),
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received: session.received.iter().copied().collect(),
            state: session.state.as_str().to_string(),
            metadata: session.metadata.clone(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
            expires_at: session.expires_at.to_rfc3339(),
        }
    }
}

impl SessionRecord {
    fn into_session(self) -> Result<UploadSession> {
        Ok(UploadSession {
            id: Uuid::parse_str(&self.id)?,
            owner: self.owner,
            target_filename: self.target_filename,
            original_filename: self.original_filename,
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            received: self.received.into_iter().collect::<BTreeSet<u64>>(),
            state: SessionState::from_str(&self.state).unwrap_or(SessionState::Pending),
            metadata: self.metadata,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            expires_at: parse_timestamp(&self.expires_at)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct VideoRecord {
    id: String,
    owner: String,
    title: String,
    description: String,
    tags: Vec<String>,
    category: String,
    mime_type: String,
    storage_key: String,
    thumbnail_key: String,
    duration_s: f64,
    resolution: String,
    codec: String,
    file_size: u64,
    bitrate: u64,
    state: String,
    views: u64,
    likes: u64,
    created_at: String,
    updated_at: String,
}

impl From<&Video> for VideoRecord {
    fn from(video: &Video) -> Self {
        Self {
            id: video.id.to_string(),
            owner: video.owner.clone(),
            title: video.title.clone(),
            description: video.description.clone(),
            tags: video.tags.clone(),
            category: video.category.clone(),
            mime_type: video.mime_type.clone(),
            storage_key: video.storage_key.clone(),
            thumbnail_key: video.thumbnail_key.clone(),
            duration_s: video.duration_s,
            resolution: video.resolution.clone(),
            codec: video.codec.clone(),
            file_size: video.file_size,
            bitrate: video.bitrate,
            state: video.state.as_str().to_string(),
            views: video.views,
            likes: video.likes,
            created_at: video.created_at.to_rfc3339(),
            updated_at: video.updated_at.to_rfc3339(),
        }
    }
}

impl VideoRecord {
    fn into_video(self) -> Result<Video> {
        Ok(Video {
            id: Uuid::parse_str(&self.id)?,
            owner: self.owner,
            title: self.title,
            description: self.description,
            tags: self.tags,
            category: self.category,
            mime_type: self.mime_type,
            storage_key: self.storage_key,
            thumbnail_key: self.thumbnail_key,
            duration_s: self.duration_s,
            resolution: self.resolution,
            codec: self.codec,
            file_size: self.file_size,
            bitrate: self.bitrate,
            state: VideoState::from_str(&self.state).unwrap_or(VideoState::Processing),
            views: self.views,
            likes: self.likes,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| AppError::internal(format!("Invalid date: {}", e)))?
        .with_timezone(&Utc))
}
