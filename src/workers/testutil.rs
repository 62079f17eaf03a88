//! Shared fixtures for worker tests.

use crate::config::{
    ChunkIndexConfig, Config, LoggingConfig, ProcessingConfig, QueueConfig, RateLimitConfig,
    ServerConfig, StorageConfig, UploadConfig,
};
use crate::error::{AppError, Result};
use crate::models::ProbeResult;
use crate::services::probe::VideoProber;
use crate::state::AppState;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Prober returning canned results and writing a marker JPEG
pub(crate) struct FakeProber {
    pub probe_result: ProbeResult,
    pub fail_probe: AtomicBool,
    pub fail_thumbnail: AtomicBool,
}

impl FakeProber {
    pub fn new(duration_s: f64, file_size: u64) -> Self {
        Self {
            probe_result: ProbeResult {
                duration_s,
                resolution: "1920x1080".to_string(),
                codec: "h264".to_string(),
                file_size,
                bitrate: 2_000_000,
            },
            fail_probe: AtomicBool::new(false),
            fail_thumbnail: AtomicBool::new(false),
        }
    }
}

impl VideoProber for FakeProber {
    fn probe<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<ProbeResult>> {
        async {
            if self.fail_probe.load(Ordering::SeqCst) {
                return Err(AppError::internal("probe failed"));
            }
            Ok(self.probe_result.clone())
        }
        .boxed()
    }

    fn thumbnail<'a>(
        &'a self,
        _src: &'a Path,
        dst: &'a Path,
        _seek_seconds: f64,
        _width: u32,
        _height: u32,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if self.fail_thumbnail.load(Ordering::SeqCst) {
                return Err(AppError::internal("thumbnail failed"));
            }
            tokio::fs::write(dst, b"\xff\xd8\xff\xe0fake-jpeg").await?;
            Ok(())
        }
        .boxed()
    }
}

/// Build an `AppState` over a temp directory with the given prober
pub(crate) async fn test_state_with_prober(
    prober: Arc<dyn VideoProber>,
) -> (AppState, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            admin_host: "127.0.0.1".to_string(),
            admin_port: 0,
            base_url: "http://localhost".to_string(),
            request_timeout: 30,
            cache_max_age: 60,
            cleanup_interval_seconds: 300,
        },
        storage: StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            uploads_dir: "uploads".to_string(),
            chunks_dir: "chunks".to_string(),
            thumbnails_dir: "thumbnails".to_string(),
        },
        upload: UploadConfig {
            max_file_size: 1024 * 1024,
            max_chunk_size: 1024,
            session_ttl_seconds: 3600,
        },
        queue: QueueConfig::default(),
        processing: ProcessingConfig::default(),
        chunk_index: ChunkIndexConfig::default(),
        rate_limit: RateLimitConfig {
            enabled: false,
            chunk_uploads_per_window: 200,
            window_seconds: 60,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
    };

    let state = AppState::with_prober(config, prober).await.unwrap();
    (state, temp_dir)
}

/// Build an `AppState` with a well-behaved fake prober
pub(crate) async fn test_state() -> (AppState, TempDir) {
    test_state_with_prober(Arc::new(FakeProber::new(10.0, 1000))).await
}
