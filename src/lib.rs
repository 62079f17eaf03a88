//! # Video Ingest Server
//!
//! The ingestion and processing core of a video content platform,
//! written in Rust.
//!
//! ## Features
//!
//! - **Chunked Upload**: Resumable uploads for large files from many
//!   concurrent clients
//! - **Durable Work Bus**: Queued commit/assembly/processing with bounded
//!   retry and dead-letter routing
//! - **Crash-Safe Resumption**: Sessions, chunks and queued work survive
//!   process restarts
//! - **Post-Processing**: Probe-derived metadata and thumbnails
//! - **Range Streaming**: Byte-range serving of assembled originals
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    HTTP Server                        │
//! │  ┌────────────┐ ┌─────────────┐ ┌────────────────┐  │
//! │  │ Upload API │ │ Stream API  │ │ Admin API      │  │
//! │  └─────┬──────┘ └─────────────┘ └────────────────┘  │
//! ├────────┼─────────────────────────────────────────────┤
//! │        ▼          Work Bus (durable)                  │
//! │  chunk_processing ─▶ file_assembly ─▶ video_processing│
//! │  ┌────────────┐ ┌─────────────┐ ┌────────────────┐  │
//! │  │ Commit     │ │ Assembly    │ │ Post-Processing│  │
//! │  │ Workers    │ │ Worker      │ │ Workers        │  │
//! │  └────────────┘ └─────────────┘ └────────────────┘  │
//! ├──────────────────────────────────────────────────────┤
//! │       File System (blobs) / RocksDB (metadata)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the server
//! cargo run --release
//!
//! # Initialize an upload
//! curl -X POST http://localhost:3000/upload/initialize \
//!   -H "X-User-Id: user-1" -H "Content-Type: application/json" \
//!   -d '{"filename":"clip.mp4","fileSize":2621440,"chunkSize":1048576}'
//!
//! # Stream the result
//! curl -H "Range: bytes=0-1023" http://localhost:3000/stream/{file}
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;
pub mod workers;

pub use config::Config;
pub use error::{AppError, Result};
pub use middleware::{Caller, RateLimiter};
pub use state::AppState;
pub use workers::spawn_workers;

use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::info;

/// Run the video ingest server with the given configuration.
///
/// This function starts the public and admin API servers, the worker
/// fleet, and the periodic GC task, and drains the workers on shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // Create application state
    let state = AppState::new(config.clone()).await?;

    // Create routers
    let public_app = create_public_router(state.clone());
    let admin_app = create_admin_router(state.clone());

    // Start servers
    let public_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid public server address");

    let admin_addr: SocketAddr =
        format!("{}:{}", config.server.admin_host, config.server.admin_port)
            .parse()
            .expect("Invalid admin server address");

    info!(address = %public_addr, "Public API server starting");
    info!(address = %admin_addr, "Admin API server starting");

    // Start the worker fleet
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = spawn_workers(state.clone(), shutdown_rx.clone());

    // Start GC task
    let gc_state = state.clone();
    let gc_shutdown = shutdown_rx.clone();
    let gc_handle = tokio::spawn(async move {
        gc_task(gc_state, gc_shutdown).await;
    });

    // Run both servers concurrently until one exits or shutdown is requested
    let public_listener = TcpListener::bind(public_addr).await?;
    let admin_listener = TcpListener::bind(admin_addr).await?;

    tokio::select! {
        result = axum::serve(public_listener, public_app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Public server error");
            }
        }
        result = axum::serve(admin_listener, admin_app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Admin server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Workers finish the delivery in hand, then exit
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = gc_handle.await;

    info!("Shutdown complete");
    Ok(())
}

/// Create the public API router
pub fn create_public_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Body size limit: one chunk part plus multipart framing. The axum
    // default body limit sits below one chunk and must be raised too.
    let max_body = state.config.upload.max_chunk_size as usize + 64 * 1024;
    let body_limit = RequestBodyLimitLayer::new(max_body);
    let default_body_limit = axum::extract::DefaultBodyLimit::max(max_body);

    // Rate limiter for the chunk intake path (from config)
    let rate_limiter = RateLimiter::new(&state.config.rate_limit);

    if state.config.rate_limit.enabled {
        info!(
            chunk_uploads_per_window = state.config.rate_limit.chunk_uploads_per_window,
            window_seconds = state.config.rate_limit.window_seconds,
            "Rate limiting enabled"
        );
    }

    Router::new()
        .nest("/upload", handlers::upload_routes(&rate_limiter))
        .nest("/stream", handlers::stream_routes())
        .nest("/health", handlers::health_routes())
        .layer(cors)
        .layer(body_limit)
        .layer(default_body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the admin API router (localhost only)
pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .nest("/admin", handlers::admin_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Background task for periodic garbage collection.
///
/// Removes expired sessions together with their chunks, evicts expired
/// chunk index keys, and sweeps orphaned temp blobs.
async fn gc_task(state: AppState, shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.cleanup_interval());

    loop {
        tokio::time::sleep(interval).await;

        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = state.sessions.gc_expired(Utc::now()).await {
            tracing::warn!(error = %e, "Session GC pass failed");
        }

        state.index.purge_expired();

        let _ = state
            .storage
            .cleanup_stale_temp(state.config.upload.session_ttl_seconds)
            .await;
    }
}
