//! Blob store for file operations.
//!
//! This module handles all file system operations behind a flat key
//! namespace with three logical prefixes:
//!
//! ```text
//! data/
//! ├── chunks/       # In-flight chunk blobs and pre-rename scratch files
//! │   ├── temp_{ts}_{rand}
//! │   └── {session_id}_chunk_{i}
//! ├── uploads/      # Assembled originals
//! │   └── {uuid}{ext}
//! └── thumbnails/   # Generated JPEG thumbnails
//!     └── {video_id}.jpg
//! ```
//!
//! Written bytes are flushed and synced before an operation reports
//! success, and `rename` is atomic with respect to concurrent readers.

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Blob store managing scoped byte storage
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// Path to the uploads directory
    uploads_dir: PathBuf,
    /// Path to the chunks directory
    chunks_dir: PathBuf,
    /// Path to the thumbnails directory
    thumbnails_dir: PathBuf,
}

/// Open handle for streaming bytes into a blob
pub struct BlobWriter {
    file: fs::File,
    path: PathBuf,
    written: u64,
}

impl BlobWriter {
    /// Append a buffer to the blob
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and sync the blob, making the write durable
    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        debug!(path = %self.path.display(), size = self.written, "Blob written");
        Ok(self.written)
    }

    /// Abort the write and remove the partial blob
    pub async fn abort(self) -> Result<()> {
        drop(self.file);
        if self.path.exists() {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

impl BlobStore {
    /// Create a new blob store and initialize directories
    ///
    /// # Errors
    /// Returns error if directories cannot be created
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let store = Self {
            uploads_dir: config.uploads_path(),
            chunks_dir: config.chunks_path(),
            thumbnails_dir: config.thumbnails_path(),
        };

        for dir in [&store.uploads_dir, &store.chunks_dir, &store.thumbnails_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).await?;
                debug!(path = %dir.display(), "Created storage directory");
            }
        }

        info!(
            uploads = %store.uploads_dir.display(),
            chunks = %store.chunks_dir.display(),
            thumbnails = %store.thumbnails_dir.display(),
            "Blob store initialized"
        );

        Ok(store)
    }

    /// Resolve a key like `chunks/{name}` to its path on disk.
    ///
    /// Keys are a single prefix plus a flat file name; anything else is
    /// rejected so a key can never escape the data directory.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        let (prefix, name) = key
            .split_once('/')
            .ok_or_else(|| AppError::invalid_input(format!("Malformed blob key: {}", key)))?;

        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(AppError::invalid_input(format!(
                "Malformed blob key: {}",
                key
            )));
        }

        let dir = match prefix {
            "uploads" => &self.uploads_dir,
            "chunks" => &self.chunks_dir,
            "thumbnails" => &self.thumbnails_dir,
            _ => {
                return Err(AppError::invalid_input(format!(
                    "Unknown blob prefix: {}",
                    prefix
                )))
            }
        };

        Ok(dir.join(name))
    }

    /// Open a writer for streaming bytes into a new blob
    pub async fn create(&self, key: &str) -> Result<BlobWriter> {
        let path = self.resolve(key)?;
        let file = fs::File::create(&path).await?;

        Ok(BlobWriter {
            file,
            path,
            written: 0,
        })
    }

    /// Stream a reader into a blob, returning the byte count
    pub async fn put_stream<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.create(key).await?;
        let copied = tokio::io::copy(reader, &mut writer.file).await?;
        writer.written = copied;
        writer.finish().await
    }

    /// Open a blob for reading, returning the file handle and its length
    pub async fn open(&self, key: &str) -> Result<(fs::File, u64)> {
        let path = self.resolve(key)?;

        if !path.exists() {
            return Err(AppError::not_found(format!("Blob not found: {}", key)));
        }

        let file = fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Read a blob in full
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;

        if !path.exists() {
            return Err(AppError::not_found(format!("Blob not found: {}", key)));
        }

        Ok(fs::read(&path).await?)
    }

    /// Atomically rename a blob
    ///
    /// # Errors
    /// `NotFound` if the source is absent
    pub async fn rename(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.resolve(src_key)?;
        let dst = self.resolve(dst_key)?;

        if !src.exists() {
            return Err(AppError::not_found(format!("Blob not found: {}", src_key)));
        }

        fs::rename(&src, &dst).await?;
        debug!(src = src_key, dst = dst_key, "Renamed blob");
        Ok(())
    }

    /// Delete a blob; deleting an absent key is a no-op
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;

        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(key = key, "Deleted blob");
        }

        Ok(())
    }

    /// Check whether a blob exists
    pub async fn exists(&self, key: &str) -> bool {
        self.resolve(key).map(|p| p.exists()).unwrap_or(false)
    }

    /// List keys under `chunks/` whose file name starts with `name_prefix`.
    ///
    /// Used by session cleanup and the GC scan; the hot path never lists.
    pub async fn list_chunks(&self, name_prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.chunks_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(name_prefix) {
                keys.push(format!("chunks/{}", name));
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Delete every chunk blob belonging to a session, returning the count
    pub async fn delete_session_chunks(&self, session_id: uuid::Uuid) -> Result<usize> {
        let prefix = format!("{}_chunk_", session_id);
        let keys = self.list_chunks(&prefix).await?;
        let count = keys.len();

        for key in keys {
            self.delete(&key).await?;
        }

        if count > 0 {
            debug!(session_id = %session_id, count = count, "Deleted session chunks");
        }

        Ok(count)
    }

    /// Remove pre-rename scratch blobs older than `max_age_secs`.
    ///
    /// A crash between writing a temp blob and enqueueing its commit can
    /// orphan the blob; the GC pass sweeps those by modification time.
    pub async fn cleanup_stale_temp(&self, max_age_secs: u64) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();
        let max_age = std::time::Duration::from_secs(max_age_secs);

        let mut entries = fs::read_dir(&self.chunks_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("temp_") {
                continue;
            }

            if let Ok(metadata) = entry.metadata().await {
                if let Ok(modified) = metadata.modified() {
                    if let Ok(age) = now.duration_since(modified) {
                        if age > max_age {
                            if let Err(e) = fs::remove_file(entry.path()).await {
                                warn!(
                                    path = %entry.path().display(),
                                    error = %e,
                                    "Failed to cleanup stale temp blob"
                                );
                            } else {
                                cleaned += 1;
                            }
                        }
                    }
                }
            }
        }

        if cleaned > 0 {
            info!(count = cleaned, "Cleaned up stale temp blobs");
        }

        Ok(cleaned)
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats> {
        let uploads_size = Self::dir_size(&self.uploads_dir).await?;
        let chunks_size = Self::dir_size(&self.chunks_dir).await?;
        let thumbnails_size = Self::dir_size(&self.thumbnails_dir).await?;

        let uploads_count = Self::file_count(&self.uploads_dir).await?;
        let chunks_count = Self::file_count(&self.chunks_dir).await?;

        Ok(StorageStats {
            uploads_size,
            chunks_size,
            thumbnails_size,
            total_size: uploads_size + chunks_size + thumbnails_size,
            uploads_count,
            chunks_count,
        })
    }

    /// Calculate total size of a directory
    async fn dir_size(path: &Path) -> Result<u64> {
        let mut total = 0;

        if !path.exists() {
            return Ok(0);
        }

        let mut entries = fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }

        Ok(total)
    }

    /// Count files in a directory
    async fn file_count(path: &Path) -> Result<usize> {
        let mut count = 0;

        if !path.exists() {
            return Ok(0);
        }

        let mut entries = fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Storage statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Size of uploads directory in bytes
    pub uploads_size: u64,
    /// Size of chunks directory in bytes
    pub chunks_size: u64,
    /// Size of thumbnails directory in bytes
    pub thumbnails_size: u64,
    /// Total storage size in bytes
    pub total_size: u64,
    /// Number of assembled originals
    pub uploads_count: usize,
    /// Number of chunk blobs on disk
    pub chunks_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn create_test_store() -> (BlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            uploads_dir: "uploads".to_string(),
            chunks_dir: "chunks".to_string(),
            thumbnails_dir: "thumbnails".to_string(),
        };

        let store = BlobStore::new(&config).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_read() {
        let (store, _temp) = create_test_store().await;
        let data = b"test video data";

        let written = store
            .put_stream("uploads/test.mp4", &mut &data[..])
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);

        let read_back = store.read("uploads/test.mp4").await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_rename_is_visible_to_open() {
        let (store, _temp) = create_test_store().await;
        store
            .put_stream("chunks/temp_1_abc", &mut &b"chunk"[..])
            .await
            .unwrap();

        store
            .rename("chunks/temp_1_abc", "chunks/s_chunk_0")
            .await
            .unwrap();

        assert!(!store.exists("chunks/temp_1_abc").await);
        let (_file, len) = store.open("chunks/s_chunk_0").await.unwrap();
        assert_eq!(len, 5);
    }

    #[tokio::test]
    async fn test_rename_missing_source() {
        let (store, _temp) = create_test_store().await;
        let result = store.rename("chunks/ghost", "chunks/dst").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _temp) = create_test_store().await;
        store
            .put_stream("thumbnails/x.jpg", &mut &b"jpeg"[..])
            .await
            .unwrap();

        store.delete("thumbnails/x.jpg").await.unwrap();
        assert!(!store.exists("thumbnails/x.jpg").await);
        // Second delete is a no-op
        store.delete("thumbnails/x.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_key_traversal_rejected() {
        let (store, _temp) = create_test_store().await;
        assert!(store.resolve("uploads/../secret").is_err());
        assert!(store.resolve("uploads/a/b").is_err());
        assert!(store.resolve("other/file").is_err());
        assert!(store.resolve("noprefix").is_err());
    }

    #[tokio::test]
    async fn test_delete_session_chunks() {
        let (store, _temp) = create_test_store().await;
        let sid = Uuid::new_v4();
        let other = Uuid::new_v4();

        for i in 0..3 {
            store
                .put_stream(&format!("chunks/{}_chunk_{}", sid, i), &mut &b"x"[..])
                .await
                .unwrap();
        }
        store
            .put_stream(&format!("chunks/{}_chunk_0", other), &mut &b"y"[..])
            .await
            .unwrap();

        let deleted = store.delete_session_chunks(sid).await.unwrap();
        assert_eq!(deleted, 3);
        assert!(store.exists(&format!("chunks/{}_chunk_0", other)).await);
    }

    #[tokio::test]
    async fn test_writer_abort_removes_partial() {
        let (store, _temp) = create_test_store().await;
        let mut writer = store.create("uploads/partial.mp4").await.unwrap();
        writer.write_all(b"half").await.unwrap();
        writer.abort().await.unwrap();

        assert!(!store.exists("uploads/partial.mp4").await);
    }
}
