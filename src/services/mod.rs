//! Core services for the video ingest server.
//!
//! - `storage`: Blob store for chunks, assembled originals and thumbnails
//! - `database`: Metadata store for sessions and videos (RocksDB)
//! - `chunk_index`: Fast per-session set of received chunk indices
//! - `queue`: Durable work bus with retry and dead-letter routing
//! - `session_manager`: The upload session state machine
//! - `probe`: Opaque probe/thumbnail contract of the video tool
//! - `cache`: Listing cache

pub mod cache;
pub mod chunk_index;
pub mod database;
pub mod probe;
pub mod queue;
pub mod session_manager;
pub mod storage;

pub use cache::ListingCache;
pub use chunk_index::ChunkIndex;
pub use database::MetadataStore;
pub use probe::{FfmpegProber, VideoProber};
pub use queue::{WorkBus, ASSEMBLY_PIPELINE, CHUNK_PIPELINE, PROCESS_PIPELINE};
pub use session_manager::SessionManager;
pub use storage::BlobStore;
