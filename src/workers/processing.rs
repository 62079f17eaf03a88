//! Post-processing worker.
//!
//! Consumes `ProcessVideo` messages: probes the assembled blob, generates
//! a thumbnail, and transitions the video to `ready`. A probe or
//! thumbnail failure marks the video `failed` and acks; the blob stays in
//! place for manual inspection.
//!
//! Thumbnail strategy: blobs above the large-file threshold take a fixed
//! 30 second seek (full decodes of multi-gigabyte files are too slow);
//! if that path exceeds its timeout, the midpoint strategy takes over.
//! Smaller blobs sample the 50% timestamp directly.

use crate::error::{AppError, Result};
use crate::models::{Job, ProbeResult, VideoState};
use crate::services::cache::ListingCache;
use crate::services::PROCESS_PIPELINE;
use crate::state::AppState;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{settle, POLL_TIMEOUT};

/// Thumbnail dimensions
const THUMB_WIDTH: u32 = 320;
const THUMB_HEIGHT: u32 = 240;

/// Seek offset for the large-file thumbnail path
const LARGE_FILE_SEEK_SECONDS: f64 = 30.0;

/// Worker loop
pub async fn run(state: AppState, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = match state.bus.dequeue(PROCESS_PIPELINE.main, POLL_TIMEOUT).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(queue = PROCESS_PIPELINE.main, error = %e, "Dequeue error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let result = match delivery.envelope.payload.clone() {
            Job::ProcessVideo {
                video_id,
                storage_key,
                ..
            } => process_video(&state, video_id, &storage_key).await,
            other => Err(AppError::fatal(format!(
                "Unexpected payload on process queue: {:?}",
                other
            ))),
        };

        settle(&state, PROCESS_PIPELINE, &delivery, result);
    }
}

/// Probe one assembled blob and derive its thumbnail
async fn process_video(state: &AppState, video_id: Uuid, storage_key: &str) -> Result<()> {
    let video = state
        .db
        .get_video(video_id)?
        .ok_or_else(|| AppError::not_found(format!("Video not found: {}", video_id)))?;

    if video.state == VideoState::Ready {
        // Redelivery after a completed run
        return Ok(());
    }

    let src = state.storage.resolve(storage_key)?;

    let mut probe = match state.prober.probe(&src).await {
        Ok(probe) => probe,
        Err(e) => {
            warn!(video_id = %video_id, error = %e, "Probe failed, marking video failed");
            let failed = state.db.update_video(video_id, |v| v.mark_failed()).await?;
            state
                .cache
                .invalidate_prefix(&ListingCache::category_prefix(&failed.category));
            return Ok(());
        }
    };

    if probe.file_size == 0 {
        if let Ok((_, len)) = state.storage.open(storage_key).await {
            probe.file_size = len;
        }
    }

    let thumbnail_key = format!("thumbnails/{}.jpg", video_id);
    if let Err(e) = generate_thumbnail(state, &probe, storage_key, &thumbnail_key).await {
        warn!(video_id = %video_id, error = %e, "Thumbnail generation failed, marking video failed");
        let failed = state.db.update_video(video_id, |v| v.mark_failed()).await?;
        state
            .cache
            .invalidate_prefix(&ListingCache::category_prefix(&failed.category));
        return Ok(());
    }

    let updated = state
        .db
        .update_video(video_id, |v| v.apply_probe(&probe, thumbnail_key.clone()))
        .await?;

    state
        .cache
        .invalidate_prefix(&ListingCache::category_prefix(&updated.category));

    info!(
        video_id = %video_id,
        duration_s = probe.duration_s,
        resolution = %probe.resolution,
        "Video ready"
    );

    Ok(())
}

/// Write the thumbnail JPEG, picking the seek strategy by blob size
async fn generate_thumbnail(
    state: &AppState,
    probe: &ProbeResult,
    storage_key: &str,
    thumbnail_key: &str,
) -> Result<()> {
    let src = state.storage.resolve(storage_key)?;
    let dst = state.storage.resolve(thumbnail_key)?;

    let midpoint = probe.duration_s * 0.5;

    if probe.file_size > state.large_file_threshold() {
        let timeout = Duration::from_secs(state.thumbnail_timeout());
        let fixed_seek = LARGE_FILE_SEEK_SECONDS.min(probe.duration_s);

        match tokio::time::timeout(
            timeout,
            state
                .prober
                .thumbnail(&src, &dst, fixed_seek, THUMB_WIDTH, THUMB_HEIGHT),
        )
        .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(key = storage_key, error = %e, "Fixed-seek thumbnail failed, using midpoint");
            }
            Err(_) => {
                warn!(key = storage_key, "Fixed-seek thumbnail timed out, using midpoint");
            }
        }
    }

    state
        .prober
        .thumbnail(&src, &dst, midpoint, THUMB_WIDTH, THUMB_HEIGHT)
        .await
}
