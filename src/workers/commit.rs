//! Chunk commit worker.
//!
//! Consumes `CommitChunk` messages: promotes the temp blob to its
//! canonical chunk key, records the receipt with the session manager, and
//! fans out an `AssembleFile` job when the session completes.
//!
//! Every step is idempotent under redelivery: a canonical key that
//! already exists means a previous attempt got past the rename, so the
//! temp blob is discarded and the commit proceeds; a session that no
//! longer exists means the upload was cancelled and the message is
//! dropped.

use crate::error::{AppError, Result};
use crate::models::{Job, SessionState};
use crate::services::{ASSEMBLY_PIPELINE, CHUNK_PIPELINE};
use crate::state::AppState;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{settle, POLL_TIMEOUT};

/// Worker loop; one task per configured chunk worker
pub async fn run(state: AppState, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = match state.bus.dequeue(CHUNK_PIPELINE.main, POLL_TIMEOUT).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(queue = CHUNK_PIPELINE.main, error = %e, "Dequeue error");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let result = match delivery.envelope.payload.clone() {
            Job::CommitChunk {
                session_id,
                chunk_index,
                temp_key,
                owner,
            } => commit_chunk(&state, session_id, chunk_index, &temp_key, &owner).await,
            other => Err(AppError::fatal(format!(
                "Unexpected payload on chunk queue: {:?}",
                other
            ))),
        };

        settle(&state, CHUNK_PIPELINE, &delivery, result);
    }
}

/// Commit one chunk
async fn commit_chunk(
    state: &AppState,
    session_id: Uuid,
    chunk_index: u64,
    temp_key: &str,
    owner: &str,
) -> Result<()> {
    let canonical_key = format!("chunks/{}_chunk_{}", session_id, chunk_index);

    if state.storage.exists(&canonical_key).await {
        // Retry after a crash between rename and record: the canonical blob
        // is already in place, only the temp copy must go
        debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            "Canonical chunk already present, discarding temp blob"
        );
        state.storage.delete(temp_key).await?;
    } else {
        match state.storage.rename(temp_key, &canonical_key).await {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                // Temp blob gone and no canonical: the session was cancelled
                // and its chunks swept; record_chunk below settles the drop
                debug!(
                    session_id = %session_id,
                    chunk_index = chunk_index,
                    "Temp blob vanished before commit"
                );
            }
            Err(e) => return Err(e),
        }
    }

    let session = match state.sessions.record_chunk(session_id, chunk_index).await {
        Ok(session) => session,
        Err(e @ AppError::NotFound(_)) => {
            // The session was cancelled or collected underneath us; the
            // promoted chunk must not linger
            let _ = state.storage.delete(&canonical_key).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if session.state == SessionState::Completed {
        // Duplicate enqueues are safe: assembly is idempotent per session
        state.bus.submit(
            ASSEMBLY_PIPELINE,
            Job::AssembleFile {
                session_id,
                owner: owner.to_string(),
            },
        )?;
        info!(session_id = %session_id, "Session complete, assembly queued");
    }

    Ok(())
}
