//! Video probing and thumbnail generation.
//!
//! The ingest core treats the video tool as an opaque collaborator: a
//! probe yields duration/resolution/codec/bitrate, and a thumbnail
//! operation writes a JPEG from a seek offset. `VideoProber` is that
//! contract; `FfmpegProber` implements it with `ffprobe`/`ffmpeg` child
//! processes. Tests inject their own implementation.

use crate::error::{AppError, Result};
use crate::models::ProbeResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Opaque probe/thumbnail contract of the external video tool
pub trait VideoProber: Send + Sync {
    /// Extract duration, resolution, codec, bitrate and size from a blob
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<ProbeResult>>;

    /// Write a JPEG frame captured at `seek_seconds` into `dst`
    fn thumbnail<'a>(
        &'a self,
        src: &'a Path,
        dst: &'a Path,
        seek_seconds: f64,
        width: u32,
        height: u32,
    ) -> BoxFuture<'a, Result<()>>;
}

/// `ffprobe`/`ffmpeg` backed prober
#[derive(Debug, Clone, Default)]
pub struct FfmpegProber;

impl FfmpegProber {
    pub fn new() -> Self {
        Self
    }

    async fn run_ffprobe(path: &Path) -> Result<ProbeResult> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::transient(format!("Failed to spawn ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::internal(format!("ffprobe failed: {}", stderr)));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;

        let format = &parsed["format"];
        let duration_s: f64 = format["duration"]
            .as_str()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0);
        let bitrate: u64 = format["bit_rate"]
            .as_str()
            .and_then(|b| b.parse().ok())
            .unwrap_or(0);
        let file_size: u64 = format["size"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let video_stream = parsed["streams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|s| s["codec_type"].as_str() == Some("video"))
            })
            .cloned()
            .unwrap_or_default();

        let width = video_stream["width"].as_u64().unwrap_or(0);
        let height = video_stream["height"].as_u64().unwrap_or(0);
        let codec = video_stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        let result = ProbeResult {
            duration_s,
            resolution: format!("{}x{}", width, height),
            codec,
            file_size,
            bitrate,
        };

        debug!(path = %path.display(), duration_s = result.duration_s, "Probed video");
        Ok(result)
    }

    async fn run_ffmpeg_thumbnail(
        src: &Path,
        dst: &Path,
        seek_seconds: f64,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-ss")
            .arg(format!("{:.3}", seek_seconds))
            .arg("-i")
            .arg(src)
            .args(["-frames:v", "1"])
            .arg("-s")
            .arg(format!("{}x{}", width, height))
            .args(["-q:v", "2"])
            .arg(dst)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::transient(format!("Failed to spawn ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::internal(format!(
                "ffmpeg thumbnail failed: {}",
                stderr
            )));
        }

        info!(
            src = %src.display(),
            dst = %dst.display(),
            seek_seconds = seek_seconds,
            "Generated thumbnail"
        );
        Ok(())
    }
}

impl VideoProber for FfmpegProber {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<ProbeResult>> {
        Self::run_ffprobe(path).boxed()
    }

    fn thumbnail<'a>(
        &'a self,
        src: &'a Path,
        dst: &'a Path,
        seek_seconds: f64,
        width: u32,
        height: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Self::run_ffmpeg_thumbnail(src, dst, seek_seconds, width, height).boxed()
    }
}
