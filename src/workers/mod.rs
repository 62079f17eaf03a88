//! Queue consumers driving the ingestion pipeline.
//!
//! - `commit`: Chunk commit worker (rename + record + fan-out)
//! - `assembly`: Assembly worker (ordered concatenation + publish)
//! - `processing`: Post-processing worker (probe + thumbnail)
//!
//! Workers are plain tokio tasks fed by the work bus. A worker dequeues
//! with a short timeout so shutdown is observed between messages and a
//! delivery in hand is always settled (ack or nack) before the loop
//! re-checks the shutdown signal. No worker holds a database row lock
//! across blob I/O.

pub mod assembly;
pub mod commit;
pub mod processing;

#[cfg(test)]
pub(crate) mod testutil;

use crate::error::{AppError, Result};
use crate::services::queue::{Delivery, Pipeline};
use crate::services::{ASSEMBLY_PIPELINE, CHUNK_PIPELINE, PROCESS_PIPELINE};
use crate::state::AppState;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How long a worker blocks on an empty queue before re-checking shutdown
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Settle a delivery according to the error-routing policy:
/// success acks, a vanished referent is dropped (cancelled upstream),
/// transient failures retry, everything else is dead-lettered.
pub(crate) fn settle(
    state: &AppState,
    pipeline: Pipeline,
    delivery: &Delivery,
    result: Result<()>,
) {
    match result {
        Ok(()) => {
            if let Err(e) = state.bus.ack(delivery) {
                error!(queue = delivery.queue(), error = %e, "Failed to ack delivery");
            }
        }
        Err(AppError::NotFound(reason)) => {
            debug!(
                queue = delivery.queue(),
                reason = %reason,
                "Dropping job for vanished referent"
            );
            if let Err(e) = state.bus.ack(delivery) {
                error!(queue = delivery.queue(), error = %e, "Failed to ack dropped delivery");
            }
        }
        Err(e) => {
            let fatal = !e.is_retryable();
            error!(
                queue = delivery.queue(),
                retry_count = delivery.envelope.retry_count,
                fatal = fatal,
                error = %e,
                "Job failed"
            );
            if let Err(nack_err) = state.bus.nack(pipeline, delivery, fatal) {
                error!(queue = delivery.queue(), error = %nack_err, "Failed to nack delivery");
            }
        }
    }
}

/// Spawn the full worker fleet: pipeline consumers, retry pumps and DLQ
/// monitors. Returns the join handles so shutdown can await the drain.
pub fn spawn_workers(state: AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for _ in 0..state.config.queue.chunk_workers {
        handles.push(tokio::spawn(commit::run(state.clone(), shutdown.clone())));
    }
    for _ in 0..state.config.queue.assembly_workers {
        handles.push(tokio::spawn(assembly::run(state.clone(), shutdown.clone())));
    }
    for _ in 0..state.config.queue.process_workers {
        handles.push(tokio::spawn(processing::run(state.clone(), shutdown.clone())));
    }

    for pipeline in [CHUNK_PIPELINE, ASSEMBLY_PIPELINE, PROCESS_PIPELINE] {
        handles.push(tokio::spawn(run_retry_pump(
            state.clone(),
            pipeline,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(run_dlq_monitor(
            state.clone(),
            pipeline,
            shutdown.clone(),
        )));
    }

    info!(
        chunk_workers = state.config.queue.chunk_workers,
        assembly_workers = state.config.queue.assembly_workers,
        process_workers = state.config.queue.process_workers,
        "Worker fleet started"
    );

    handles
}

/// Feed a pipeline's retry queue back into its main queue
async fn run_retry_pump(state: AppState, pipeline: Pipeline, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = state.bus.pump_retries(pipeline, POLL_TIMEOUT).await {
            error!(queue = pipeline.retry, error = %e, "Retry pump error");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Ack-and-log dead-lettered messages for manual intervention
async fn run_dlq_monitor(state: AppState, pipeline: Pipeline, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = state.bus.drain_dead_letter(pipeline, POLL_TIMEOUT).await {
            error!(queue = pipeline.dlq, error = %e, "DLQ monitor error");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
