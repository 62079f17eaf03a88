//! HTTP request handlers for the video ingest server.
//!
//! This module contains all endpoint handlers organized by functionality:
//! - `upload`: Chunked upload session lifecycle and chunk intake
//! - `stream`: Range-based serving of assembled originals
//! - `admin`: Administrative endpoints (local only)
//! - `health`: Health check endpoints

pub mod admin;
pub mod health;
pub mod stream;
pub mod upload;

pub use admin::admin_routes;
pub use health::health_routes;
pub use stream::stream_routes;
pub use upload::upload_routes;
