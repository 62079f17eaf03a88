//! Common test utilities and helpers.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::watch;
use video_ingest_server::config::{
    ChunkIndexConfig, Config, LoggingConfig, ProcessingConfig, QueueConfig, RateLimitConfig,
    ServerConfig, StorageConfig, UploadConfig,
};
use video_ingest_server::error::Result;
use video_ingest_server::models::ProbeResult;
use video_ingest_server::services::probe::VideoProber;
use video_ingest_server::{create_admin_router, create_public_router, spawn_workers, AppState};

/// Default caller identity used by the tests
pub const TEST_USER: &str = "user-1";

/// Prober stand-in: canned metadata, marker-JPEG thumbnails
pub struct FakeProber;

impl VideoProber for FakeProber {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<ProbeResult>> {
        async move {
            let file_size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            Ok(ProbeResult {
                duration_s: 42.0,
                resolution: "1280x720".to_string(),
                codec: "h264".to_string(),
                file_size,
                bitrate: 1_500_000,
            })
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
            tokio::fs::write(dst, b"\xff\xd8\xff\xe0fake-jpeg").await?;
            Ok(())
        }
        .boxed()
    }
}

/// Test server instance
pub struct TestServer {
    pub public_url: String,
    pub admin_url: String,
    pub data_dir: TempDir,
    pub state: AppState,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl TestServer {
    /// Start a test server with random ports and rate limiting off
    pub async fn start() -> Self {
        Self::start_with_rate_limit(None).await
    }

    /// Start a test server with an optional chunk-upload rate limit
    pub async fn start_with_rate_limit(chunk_uploads_per_window: Option<u32>) -> Self {
        let public_port = get_available_port();
        let admin_port = get_available_port();
        let data_dir = TempDir::new().expect("Failed to create temp dir");

        let public_url = format!("http://127.0.0.1:{}", public_port);
        let admin_url = format!("http://127.0.0.1:{}", admin_port);

        let config = create_test_config(
            &data_dir,
            public_port,
            admin_port,
            &public_url,
            chunk_uploads_per_window,
        );

        let state = AppState::with_prober(config, Arc::new(FakeProber))
            .await
            .expect("Failed to create app state");

        let public_app = create_public_router(state.clone());
        let admin_app = create_admin_router(state.clone());

        let public_addr: std::net::SocketAddr =
            format!("127.0.0.1:{}", public_port).parse().unwrap();
        let admin_addr: std::net::SocketAddr =
            format!("127.0.0.1:{}", admin_port).parse().unwrap();

        let public_listener = TokioTcpListener::bind(public_addr)
            .await
            .expect("Failed to bind public listener");
        let admin_listener = TokioTcpListener::bind(admin_addr)
            .await
            .expect("Failed to bind admin listener");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Worker fleet processes commits, assembly and post-processing
        spawn_workers(state.clone(), shutdown_rx);

        // Start servers in background
        tokio::spawn(async move {
            tokio::select! {
                _ = axum::serve(public_listener, public_app) => {}
                _ = axum::serve(admin_listener, admin_app) => {}
            }
        });

        // Give servers time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            public_url,
            admin_url,
            data_dir,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get HTTP client
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// Get public URL
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.public_url, path)
    }

    /// Get admin URL
    pub fn admin(&self, path: &str) -> String {
        format!("{}{}", self.admin_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// Create test configuration
fn create_test_config(
    data_dir: &TempDir,
    public_port: u16,
    admin_port: u16,
    base_url: &str,
    chunk_uploads_per_window: Option<u32>,
) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: public_port,
            admin_host: "127.0.0.1".to_string(),
            admin_port,
            base_url: base_url.to_string(),
            request_timeout: 30,
            cache_max_age: 3600,
            cleanup_interval_seconds: 60,
        },
        storage: StorageConfig {
            data_dir: data_dir.path().to_path_buf(),
            uploads_dir: "uploads".to_string(),
            chunks_dir: "chunks".to_string(),
            thumbnails_dir: "thumbnails".to_string(),
        },
        upload: UploadConfig {
            max_file_size: 5 * 1024 * 1024 * 1024,
            max_chunk_size: 10 * 1024 * 1024,
            session_ttl_seconds: 300,
        },
        queue: QueueConfig::default(),
        processing: ProcessingConfig::default(),
        chunk_index: ChunkIndexConfig::default(),
        rate_limit: RateLimitConfig {
            enabled: chunk_uploads_per_window.is_some(),
            chunk_uploads_per_window: chunk_uploads_per_window.unwrap_or(1000),
            window_seconds: 60,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Find an available TCP port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Deterministic byte pattern for upload payloads
pub fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Initialize an upload session, returning its id as a string
pub async fn init_session(
    server: &TestServer,
    client: &reqwest::Client,
    file_size: u64,
    chunk_size: u64,
) -> String {
    let response = client
        .post(server.url("/upload/initialize"))
        .header("X-User-Id", TEST_USER)
        .json(&serde_json::json!({
            "filename": "movie.mp4",
            "fileSize": file_size,
            "chunkSize": chunk_size,
            "metadata": {"title": "Test Movie", "category": "testing"}
        }))
        .send()
        .await
        .expect("Failed to init session");

    assert_eq!(response.status(), 201, "init should return 201");
    let json: serde_json::Value = response.json().await.unwrap();
    json["sessionId"].as_str().unwrap().to_string()
}

/// Post one chunk via multipart, returning the response
pub async fn post_chunk(
    server: &TestServer,
    client: &reqwest::Client,
    session_id: &str,
    chunk_index: u64,
    data: Vec<u8>,
) -> reqwest::Response {
    post_chunk_as(server, client, session_id, chunk_index, data, TEST_USER).await
}

/// Post one chunk as a specific caller
pub async fn post_chunk_as(
    server: &TestServer,
    client: &reqwest::Client,
    session_id: &str,
    chunk_index: u64,
    data: Vec<u8>,
    user: &str,
) -> reqwest::Response {
    let form = reqwest::multipart::Form::new()
        .text("sessionId", session_id.to_string())
        .text("chunkIndex", chunk_index.to_string())
        .part(
            "chunk",
            reqwest::multipart::Part::bytes(data).file_name("chunk.bin"),
        );

    client
        .post(server.url("/upload/chunk"))
        .header("X-User-Id", user)
        .multipart(form)
        .send()
        .await
        .expect("Failed to post chunk")
}

/// Fetch the status JSON for a session, or None on a non-200 response
pub async fn session_status(
    server: &TestServer,
    client: &reqwest::Client,
    session_id: &str,
) -> Option<serde_json::Value> {
    let response = client
        .get(server.url(&format!("/upload/status/{}", session_id)))
        .header("X-User-Id", TEST_USER)
        .send()
        .await
        .expect("Failed to poll status");

    if response.status() != 200 {
        return None;
    }
    Some(response.json().await.unwrap())
}

/// Poll until the session reports `expected` committed chunks
pub async fn wait_for_uploaded_chunks(
    server: &TestServer,
    client: &reqwest::Client,
    session_id: &str,
    expected: u64,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if let Some(json) = session_status(server, client, session_id).await {
            if json["uploadedChunks"] == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll until the session has been assembled away (status returns 404)
pub async fn wait_for_session_gone(
    server: &TestServer,
    client: &reqwest::Client,
    session_id: &str,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if session_status(server, client, session_id).await.is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll until the video derived from `session_id` reaches `ready`
pub async fn wait_for_video_ready(
    server: &TestServer,
    session_id: &str,
) -> Option<video_ingest_server::models::Video> {
    use video_ingest_server::models::{Video, VideoState};

    let video_id = Video::id_for_session(session_id.parse().expect("invalid session id"));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(video)) = server.state.db.get_video(video_id) {
            if video.state == VideoState::Ready {
                return Some(video);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
