//! Assembly worker.
//!
//! Consumes `AssembleFile` messages: concatenates a completed session's
//! chunks in strictly ascending index order into the final blob, creates
//! the video record, fans out to post-processing, and retires the
//! session.
//!
//! Idempotence: the video id is derived from the session id, so a
//! redelivery after the session row is gone finds the video and acks
//! without rework; a redelivery after the output was written but before
//! the session was deleted resumes from the publish steps. The output is
//! staged under a `.part` name and renamed into place only after the last
//! byte is synced, so a partially written file is never mistaken for a
//! finished one. Chunk blobs are removed only after the rename, keeping
//! every earlier failure safely retriable.

use crate::error::{AppError, Result};
use crate::models::{Job, SessionState, Video};
use crate::services::cache::ListingCache;
use crate::services::{ASSEMBLY_PIPELINE, PROCESS_PIPELINE};
use crate::state::AppState;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{settle, POLL_TIMEOUT};

/// Worker loop; the assembly pipeline runs with prefetch 1
pub async fn run(state: AppState, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = match state.bus.dequeue(ASSEMBLY_PIPELINE.main, POLL_TIMEOUT).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(queue = ASSEMBLY_PIPELINE.main, error = %e, "Dequeue error");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let result = match delivery.envelope.payload.clone() {
            Job::AssembleFile { session_id, owner } => {
                assemble(&state, session_id, &owner).await
            }
            other => Err(AppError::fatal(format!(
                "Unexpected payload on assembly queue: {:?}",
                other
            ))),
        };

        settle(&state, ASSEMBLY_PIPELINE, &delivery, result);
    }
}

/// Assemble one session into its final blob and publish the video
async fn assemble(state: &AppState, session_id: Uuid, owner: &str) -> Result<()> {
    let video_id = Video::id_for_session(session_id);

    let session = match state.sessions.get(session_id)? {
        Some(session) => session,
        None => {
            if state.db.get_video(video_id)?.is_some() {
                // Redelivery after the session was retired; nothing to do
                info!(session_id = %session_id, "Assembly already published, acking redelivery");
                return Ok(());
            }
            return Err(AppError::not_found(format!(
                "Upload session not found: {}",
                session_id
            )));
        }
    };

    // A non-completed session on the assembly queue is a contradiction
    if session.state != SessionState::Completed || !session.is_complete() {
        let _ = state.sessions.mark_failed(session_id).await;
        return Err(AppError::fatal(format!(
            "Assembly requested for session {} in state {} with {}/{} chunks",
            session_id,
            session.state.as_str(),
            session.received.len(),
            session.total_chunks
        )));
    }

    let target_key = format!("uploads/{}", session.target_filename);

    if !state.storage.exists(&target_key).await {
        write_output(state, &session.id, session.total_chunks, &target_key).await?;
    } else {
        info!(session_id = %session_id, "Assembled blob already present, resuming publish");
    }

    // Chunks are no longer needed once the final blob is in place
    state.storage.delete_session_chunks(session_id).await?;

    // Publish the video row; a redelivery finds it and skips creation
    if state.db.get_video(video_id)?.is_none() {
        let video = Video::from_session_metadata(
            session_id,
            session.owner.clone(),
            session.title(),
            &session.metadata,
            target_key.clone(),
        );
        state.db.create_video(&video)?;
        info!(session_id = %session_id, video_id = %video_id, "Video record created");
    }

    state.bus.submit(
        PROCESS_PIPELINE,
        Job::ProcessVideo {
            video_id,
            storage_key: target_key,
            owner: owner.to_string(),
        },
    )?;

    // Retire the session; its owner's cached listings go with it
    state.sessions.delete(session_id).await?;

    // The new video changes its category's listings too
    let category = session
        .metadata
        .get("category")
        .filter(|c| !c.is_empty())
        .map(String::as_str)
        .unwrap_or("general");
    state
        .cache
        .invalidate_prefix(&ListingCache::category_prefix(category));

    info!(
        session_id = %session_id,
        video_id = %video_id,
        total_chunks = session.total_chunks,
        "Assembly completed"
    );

    Ok(())
}

/// Concatenate the chunks into a staged blob and atomically promote it
async fn write_output(
    state: &AppState,
    session_id: &Uuid,
    total_chunks: u64,
    target_key: &str,
) -> Result<()> {
    let staging_key = format!("{}.part", target_key);
    let mut writer = state.storage.create(&staging_key).await?;

    for i in 0..total_chunks {
        let chunk_key = format!("chunks/{}_chunk_{}", session_id, i);

        let data = match state.storage.read(&chunk_key).await {
            Ok(data) => data,
            Err(e) => {
                writer.abort().await?;
                if matches!(e, AppError::NotFound(_)) {
                    // A vanished chunk contradicts the completed set; the
                    // message is dead-lettered for manual intervention
                    return Err(AppError::fatal(format!(
                        "Missing chunk {} for completed session {}",
                        i, session_id
                    )));
                }
                return Err(e);
            }
        };

        if let Err(e) = writer.write_all(&data).await {
            warn!(session_id = %session_id, error = %e, "Assembly write failed, destroying partial output");
            writer.abort().await?;
            return Err(e);
        }
    }

    let size = writer.finish().await?;
    state.storage.rename(&staging_key, target_key).await?;

    info!(
        session_id = %session_id,
        key = target_key,
        size = size,
        chunks = total_chunks,
        "Assembled chunks into final blob"
    );

    Ok(())
}
