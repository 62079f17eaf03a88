//! Range-serving handler for assembled originals.
//!
//! Serves `uploads/{filename}` under HTTP byte-range semantics:
//!
//! - No `Range` header: 200 with the full blob
//! - `Range: bytes=S-` or `bytes=S-E`: 206 with `Content-Range`,
//!   `Accept-Ranges` and the exact sub-interval
//! - Out-of-range requests: 416 with `Content-Range: bytes */L`
//!
//! The body is streamed from the store with a bounded reader; the whole
//! file is never buffered in memory.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// A parsed, validated byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Outcome of interpreting the `Range` header against a blob length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// No range requested: serve the whole blob
    Full,
    /// A satisfiable range
    Partial(ByteRange),
    /// Malformed or unsatisfiable
    NotSatisfiable,
}

/// Interpret a `Range` header value against a blob of `total` bytes.
///
/// `S` defaults to 0 when missing, `E` to `total - 1`.
fn parse_range(header_value: Option<&str>, total: u64) -> RangeOutcome {
    let raw = match header_value {
        Some(raw) => raw.trim(),
        None => return RangeOutcome::Full,
    };

    let ranges = match raw.strip_prefix("bytes=") {
        Some(ranges) => ranges,
        None => return RangeOutcome::NotSatisfiable,
    };

    let (start_str, end_str) = match ranges.split_once('-') {
        Some(parts) => parts,
        None => return RangeOutcome::NotSatisfiable,
    };

    let start: u64 = if start_str.is_empty() {
        0
    } else {
        match start_str.trim().parse() {
            Ok(s) => s,
            Err(_) => return RangeOutcome::NotSatisfiable,
        }
    };

    let end: u64 = if end_str.is_empty() {
        total.saturating_sub(1)
    } else {
        match end_str.trim().parse() {
            Ok(e) => e,
            Err(_) => return RangeOutcome::NotSatisfiable,
        }
    };

    if total == 0 || start > end || end >= total {
        return RangeOutcome::NotSatisfiable;
    }

    RangeOutcome::Partial(ByteRange { start, end })
}

/// Serve an assembled original under byte-range semantics
///
/// GET /stream/{filename}
async fn stream_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let key = format!("uploads/{}", filename);
    let (mut file, total) = state.storage.open(&key).await?;

    let content_type = mime_guess::from_path(&filename)
        .first_raw()
        .unwrap_or("video/mp4");
    let cache_control = format!("public, max-age={}", state.cache_max_age());

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match parse_range(range_header, total) {
        RangeOutcome::Full => {
            let stream = ReaderStream::new(file);

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, total)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CACHE_CONTROL, cache_control)
                .header("X-Content-Type-Options", "nosniff")
                .body(Body::from_stream(stream))
                .map_err(|e| AppError::internal(format!("Failed to build response: {}", e)))?;

            debug!(key = %key, total = total, "Served full blob");
            Ok(response)
        }
        RangeOutcome::Partial(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            let stream = ReaderStream::new(file.take(range.len()));

            let response = Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, range.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, total),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CACHE_CONTROL, cache_control)
                .header("X-Content-Type-Options", "nosniff")
                .body(Body::from_stream(stream))
                .map_err(|e| AppError::internal(format!("Failed to build response: {}", e)))?;

            debug!(
                key = %key,
                start = range.start,
                end = range.end,
                total = total,
                "Served byte range"
            );
            Ok(response)
        }
        RangeOutcome::NotSatisfiable => {
            let response = Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", total))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::empty())
                .map_err(|e| AppError::internal(format!("Failed to build response: {}", e)))?;

            Ok(response)
        }
    }
}

/// Create stream routes
pub fn stream_routes() -> Router<AppState> {
    Router::new().route("/{filename}", get(stream_video))
}
