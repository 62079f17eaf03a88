//! Application state management.
//!
//! This module defines the shared application state that is accessible
//! from all request handlers via Axum's State extractor and handed to the
//! worker loops. No component is a process-wide global: every collaborator
//! is a value owned here and cloned into the tasks that need it.
//!
//! # Usage
//!
//! ```rust,ignore
//! async fn handler(State(state): State<AppState>) -> impl IntoResponse {
//!     let session = state.sessions.get(id)?;
//!     // ...
//! }
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::services::{
    BlobStore, ChunkIndex, FfmpegProber, ListingCache, MetadataStore, SessionManager,
    VideoProber, WorkBus,
};
use std::sync::Arc;

/// Shared application state
///
/// This struct holds all shared resources that handlers and workers need
/// access to. It's cloned into each request handler and worker task.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,

    /// Metadata store for sessions and videos
    pub db: MetadataStore,

    /// Blob store for chunks, originals and thumbnails
    pub storage: BlobStore,

    /// Fast chunk index
    pub index: ChunkIndex,

    /// Durable work bus
    pub bus: WorkBus,

    /// Upload session manager
    pub sessions: SessionManager,

    /// Probe/thumbnail collaborator
    pub prober: Arc<dyn VideoProber>,

    /// Listing cache
    pub cache: ListingCache,
}

impl AppState {
    /// Create application state with the ffmpeg-backed prober
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_prober(config, Arc::new(FfmpegProber::new())).await
    }

    /// Create application state with an injected prober (tests use an
    /// in-memory fake)
    pub async fn with_prober(config: Config, prober: Arc<dyn VideoProber>) -> Result<Self> {
        let db = MetadataStore::new(&config.storage)?;
        let storage = BlobStore::new(&config.storage).await?;
        let index = ChunkIndex::new(config.chunk_index.enabled, config.chunk_index.ttl_seconds);
        let bus = WorkBus::new(db.raw_db(), config.queue.max_retries)?;
        let cache = ListingCache::new(60);

        let sessions = SessionManager::new(
            db.clone(),
            index.clone(),
            storage.clone(),
            cache.clone(),
            config.upload.max_file_size,
            config.upload.max_chunk_size,
            config.upload.session_ttl_seconds,
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            storage,
            index,
            bus,
            sessions,
            prober,
            cache,
        })
    }

    /// Get the base URL for stream URLs
    pub fn base_url(&self) -> &str {
        &self.config.server.base_url
    }

    /// Get the maximum size of a single chunk part
    pub fn max_chunk_size(&self) -> u64 {
        self.config.upload.max_chunk_size
    }

    /// Get cache max age in seconds
    pub fn cache_max_age(&self) -> u64 {
        self.config.server.cache_max_age
    }

    /// Get cleanup interval in seconds
    pub fn cleanup_interval(&self) -> u64 {
        self.config.server.cleanup_interval_seconds
    }

    /// Blobs above this size take the fixed-seek thumbnail path
    pub fn large_file_threshold(&self) -> u64 {
        self.config.processing.large_file_threshold
    }

    /// Seconds before the optimised thumbnail path falls back
    pub fn thumbnail_timeout(&self) -> u64 {
        self.config.processing.thumbnail_timeout_seconds
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("db", &self.db)
            .field("storage", &self.storage)
            .field("bus", &self.bus)
            .finish()
    }
}
