//! Work bus: durable queues with retry and dead-letter routing.
//!
//! Three pipelines (`chunk`, `assembly`, `process`), each a triple of
//! `{main, retry, dlq}` queues with stable names. Every envelope is
//! persisted to the `jobs` column family before consumers are notified;
//! a dequeue moves the message from the pending prefix to the inflight
//! prefix, and only an ack deletes it. On startup `recover()` republishes
//! inflight and pending messages, so a crash mid-processing results in
//! redelivery rather than loss; consumers are idempotent.
//!
//! Retry contract: on a retryable failure the consumer nacks; the bus
//! republishes to the retry queue with `retry_count + 1` until the retry
//! budget is exhausted, then dead-letters. A retry pump drains retry
//! queues back into their mains, and a DLQ monitor acks-and-logs for
//! manual intervention. Pipeline priority is expressed through worker
//! counts: the chunk pipeline runs the widest prefetch window.
//!
//! Key layout in the `jobs` column family:
//!
//! ```text
//! q:{queue}:{seq:020}   pending envelope (JSON)
//! i:{queue}:{seq:020}   inflight envelope (JSON)
//! ```

use crate::error::{AppError, Result};
use crate::models::{Job, JobEnvelope};
use crate::services::database::{DB, CF_JOBS};
use dashmap::DashMap;
use rocksdb::WriteBatch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Names of one pipeline's queue triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipeline {
    pub main: &'static str,
    pub retry: &'static str,
    pub dlq: &'static str,
}

/// Chunk commit pipeline (high priority, widest prefetch)
pub const CHUNK_PIPELINE: Pipeline = Pipeline {
    main: "chunk_processing",
    retry: "chunk_processing_retry",
    dlq: "chunk_processing_dlq",
};

/// File assembly pipeline
pub const ASSEMBLY_PIPELINE: Pipeline = Pipeline {
    main: "file_assembly",
    retry: "file_assembly_retry",
    dlq: "file_assembly_dlq",
};

/// Video post-processing pipeline
pub const PROCESS_PIPELINE: Pipeline = Pipeline {
    main: "video_processing",
    retry: "video_processing_retry",
    dlq: "video_processing_dlq",
};

/// All pipelines, used by recovery and stats
pub const PIPELINES: [Pipeline; 3] = [CHUNK_PIPELINE, ASSEMBLY_PIPELINE, PROCESS_PIPELINE];

/// A message handed to a consumer; must be acked or nacked exactly once
#[derive(Debug)]
pub struct Delivery {
    pub envelope: JobEnvelope,
    queue: String,
    seq: u64,
}

impl Delivery {
    /// Queue this delivery came from
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Per-queue depth snapshot for the admin stats endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueDepths {
    pub queue: String,
    pub pending: u64,
    pub inflight: u64,
}

/// Durable multi-queue work bus
#[derive(Clone)]
pub struct WorkBus {
    db: Arc<DB>,
    notifies: Arc<DashMap<String, Arc<Notify>>>,
    pop_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    seq: Arc<AtomicU64>,
    max_retries: u32,
}

impl std::fmt::Debug for WorkBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkBus")
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl WorkBus {
    /// Create a work bus over the shared database and recover any messages
    /// left pending or inflight by a previous process.
    pub fn new(db: Arc<DB>, max_retries: u32) -> Result<Self> {
        let bus = Self {
            db,
            notifies: Arc::new(DashMap::new()),
            pop_locks: Arc::new(DashMap::new()),
            seq: Arc::new(AtomicU64::new(1)),
            max_retries,
        };

        bus.recover()?;
        Ok(bus)
    }

    fn cf(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db.cf_handle(CF_JOBS).expect("CF jobs must exist")
    }

    fn notify_for(&self, queue: &str) -> Arc<Notify> {
        self.notifies
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn pop_lock_for(&self, queue: &str) -> Arc<Mutex<()>> {
        self.pop_locks
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn pending_key(queue: &str, seq: u64) -> String {
        format!("q:{}:{:020}", queue, seq)
    }

    fn inflight_key(queue: &str, seq: u64) -> String {
        format!("i:{}:{:020}", queue, seq)
    }

    /// Republish inflight messages and restore the sequence counter.
    ///
    /// Inflight messages belonged to consumers that no longer exist; they
    /// go back to pending in their original queue.
    fn recover(&self) -> Result<()> {
        let cf = self.cf();
        let mut batch = WriteBatch::default();
        let mut max_seq = 0u64;
        let mut recovered = 0usize;

        let iter = self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, value) =
                item.map_err(|e| AppError::transient(format!("RocksDB iterator error: {}", e)))?;
            let key_str = String::from_utf8_lossy(&key).to_string();

            let (prefix, rest) = match key_str.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            let (queue, seq_str) = match rest.rsplit_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            let seq: u64 = seq_str.parse().unwrap_or(0);
            max_seq = max_seq.max(seq);

            if prefix == "i" {
                batch.delete_cf(&cf, key.as_ref());
                batch.put_cf(&cf, Self::pending_key(queue, seq).as_bytes(), &value);
                recovered += 1;
            }
        }

        if recovered > 0 {
            self.db
                .write(batch)
                .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;
            info!(count = recovered, "Recovered inflight queue messages");
        }

        self.seq.store(max_seq + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Persist an envelope on a queue and wake one waiting consumer
    pub fn enqueue(&self, queue: &str, envelope: &JobEnvelope) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let data = serde_json::to_vec(envelope)?;

        self.db
            .put_cf(&self.cf(), Self::pending_key(queue, seq).as_bytes(), data)
            .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

        debug!(queue = queue, seq = seq, retry_count = envelope.retry_count, "Enqueued job");
        self.notify_for(queue).notify_one();
        Ok(())
    }

    /// Enqueue a fresh job on a pipeline's main queue
    pub fn submit(&self, pipeline: Pipeline, job: Job) -> Result<()> {
        self.enqueue(pipeline.main, &JobEnvelope::new(job))
    }

    /// Pop the oldest pending message, moving it to inflight.
    ///
    /// Returns `None` when the queue stays empty for `timeout`.
    pub async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = self.notify_for(queue);
            let notified = notify.notified();

            if let Some(delivery) = self.try_pop(queue).await? {
                // Wake the next consumer in case more messages are pending
                notify.notify_one();
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Attempt a single pop without waiting
    async fn try_pop(&self, queue: &str) -> Result<Option<Delivery>> {
        let lock = self.pop_lock_for(queue);
        let _guard = lock.lock().await;

        let cf = self.cf();
        let prefix = format!("q:{}:", queue);
        let iter = self.db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) =
                item.map_err(|e| AppError::transient(format!("RocksDB iterator error: {}", e)))?;
            let key_str = String::from_utf8_lossy(&key).to_string();

            if !key_str.starts_with(&prefix) {
                break;
            }

            let seq: u64 = key_str
                .rsplit_once(':')
                .and_then(|(_, s)| s.parse().ok())
                .ok_or_else(|| AppError::internal(format!("Malformed queue key: {}", key_str)))?;

            let envelope: JobEnvelope = serde_json::from_slice(&value)?;

            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf, key.as_ref());
            batch.put_cf(&cf, Self::inflight_key(queue, seq).as_bytes(), &value);
            self.db
                .write(batch)
                .map_err(|e| AppError::transient(format!("RocksDB write failed: {}", e)))?;

            debug!(queue = queue, seq = seq, "Dequeued job");
            return Ok(Some(Delivery {
                envelope,
                queue: queue.to_string(),
                seq,
            }));
        }

        Ok(None)
    }

    /// Acknowledge a delivery, removing it from the bus
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db
            .delete_cf(
                &self.cf(),
                Self::inflight_key(&delivery.queue, delivery.seq).as_bytes(),
            )
            .map_err(|e| AppError::transient(format!("RocksDB delete failed: {}", e)))?;

        debug!(queue = %delivery.queue, seq = delivery.seq, "Acked job");
        Ok(())
    }

    /// Negatively acknowledge a delivery.
    ///
    /// Retryable failures below the retry budget republish to the
    /// pipeline's retry queue with `retry_count + 1`; everything else is
    /// dead-lettered. The original inflight entry is removed either way.
    pub fn nack(&self, pipeline: Pipeline, delivery: &Delivery, fatal: bool) -> Result<()> {
        if !fatal && delivery.envelope.retry_count < self.max_retries {
            let retried = delivery.envelope.next_retry();
            self.enqueue(pipeline.retry, &retried)?;
            warn!(
                queue = %delivery.queue,
                seq = delivery.seq,
                retry_count = retried.retry_count,
                "Nacked job, republished for retry"
            );
        } else {
            self.enqueue(pipeline.dlq, &delivery.envelope)?;
            error!(
                queue = %delivery.queue,
                seq = delivery.seq,
                retry_count = delivery.envelope.retry_count,
                fatal = fatal,
                "Job dead-lettered"
            );
        }

        self.ack(delivery)
    }

    /// Count pending and inflight messages on a queue
    pub fn depth(&self, queue: &str) -> Result<QueueDepths> {
        Ok(QueueDepths {
            queue: queue.to_string(),
            pending: self.count_prefix(&format!("q:{}:", queue))?,
            inflight: self.count_prefix(&format!("i:{}:", queue))?,
        })
    }

    /// Depths of every queue on every pipeline
    pub fn depths(&self) -> Result<Vec<QueueDepths>> {
        let mut all = Vec::new();
        for pipeline in PIPELINES {
            for queue in [pipeline.main, pipeline.retry, pipeline.dlq] {
                all.push(self.depth(queue)?);
            }
        }
        Ok(all)
    }

    fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let cf = self.cf();
        let iter = self.db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );

        let mut count = 0u64;
        for item in iter {
            let (key, _) =
                item.map_err(|e| AppError::transient(format!("RocksDB iterator error: {}", e)))?;
            if !String::from_utf8_lossy(&key).starts_with(prefix) {
                break;
            }
            count += 1;
        }

        Ok(count)
    }

    /// Drain one pipeline's retry queue back into its main queue.
    ///
    /// Called in a loop by the retry pump task.
    pub async fn pump_retries(&self, pipeline: Pipeline, timeout: Duration) -> Result<usize> {
        let mut moved = 0;

        while let Some(delivery) = self.dequeue(pipeline.retry, timeout).await? {
            self.enqueue(pipeline.main, &delivery.envelope)?;
            self.ack(&delivery)?;
            moved += 1;
        }

        Ok(moved)
    }

    /// Consume one DLQ message: log it and remove it from the bus
    pub async fn drain_dead_letter(
        &self,
        pipeline: Pipeline,
        timeout: Duration,
    ) -> Result<Option<JobEnvelope>> {
        match self.dequeue(pipeline.dlq, timeout).await? {
            Some(delivery) => {
                error!(
                    queue = pipeline.dlq,
                    retry_count = delivery.envelope.retry_count,
                    payload = ?delivery.envelope.payload,
                    "Dead-lettered job requires manual intervention"
                );
                self.ack(&delivery)?;
                Ok(Some(delivery.envelope))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::services::database::MetadataStore;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_bus() -> (WorkBus, MetadataStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            uploads_dir: "uploads".to_string(),
            chunks_dir: "chunks".to_string(),
            thumbnails_dir: "thumbnails".to_string(),
        };
        let store = MetadataStore::new(&config).unwrap();
        let bus = WorkBus::new(store.raw_db(), 3).unwrap();
        (bus, store, temp_dir)
    }

    fn test_job() -> Job {
        Job::AssembleFile {
            session_id: Uuid::new_v4(),
            owner: "user-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let (bus, _store, _temp) = create_test_bus();
        let job = test_job();

        bus.submit(ASSEMBLY_PIPELINE, job.clone()).unwrap();

        let delivery = bus
            .dequeue(ASSEMBLY_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.payload, job);
        assert_eq!(delivery.envelope.retry_count, 0);

        bus.ack(&delivery).unwrap();

        let depth = bus.depth(ASSEMBLY_PIPELINE.main).unwrap();
        assert_eq!(depth.pending, 0);
        assert_eq!(depth.inflight, 0);
    }

    #[tokio::test]
    async fn test_dequeue_timeout_on_empty_queue() {
        let (bus, _store, _temp) = create_test_bus();

        let result = bus
            .dequeue(CHUNK_PIPELINE.main, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let (bus, _store, _temp) = create_test_bus();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for session_id in [first, second] {
            bus.submit(
                ASSEMBLY_PIPELINE,
                Job::AssembleFile {
                    session_id,
                    owner: "user-1".to_string(),
                },
            )
            .unwrap();
        }

        let d1 = bus
            .dequeue(ASSEMBLY_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        match &d1.envelope.payload {
            Job::AssembleFile { session_id, .. } => assert_eq!(*session_id, first),
            other => panic!("unexpected payload: {:?}", other),
        }
        bus.ack(&d1).unwrap();
    }

    #[tokio::test]
    async fn test_nack_routes_to_retry_with_incremented_count() {
        let (bus, _store, _temp) = create_test_bus();
        bus.submit(CHUNK_PIPELINE, test_job()).unwrap();

        let delivery = bus
            .dequeue(CHUNK_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        bus.nack(CHUNK_PIPELINE, &delivery, false).unwrap();

        let retried = bus
            .dequeue(CHUNK_PIPELINE.retry, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.envelope.retry_count, 1);
        bus.ack(&retried).unwrap();
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_dead_letters() {
        let (bus, _store, _temp) = create_test_bus();
        bus.submit(CHUNK_PIPELINE, test_job()).unwrap();

        // Initial + 3 retries = 4 deliveries to a non-DLQ consumer
        let mut deliveries = 0;
        loop {
            let delivery = match bus
                .dequeue(CHUNK_PIPELINE.main, Duration::from_millis(50))
                .await
                .unwrap()
            {
                Some(d) => d,
                None => break,
            };
            deliveries += 1;
            bus.nack(CHUNK_PIPELINE, &delivery, false).unwrap();
            bus.pump_retries(CHUNK_PIPELINE, Duration::from_millis(50))
                .await
                .unwrap();
        }

        assert_eq!(deliveries, 4);
        assert_eq!(bus.depth(CHUNK_PIPELINE.dlq).unwrap().pending, 1);

        let dead = bus
            .drain_dead_letter(CHUNK_PIPELINE, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.retry_count, 3);
    }

    #[tokio::test]
    async fn test_fatal_nack_skips_retry() {
        let (bus, _store, _temp) = create_test_bus();
        bus.submit(ASSEMBLY_PIPELINE, test_job()).unwrap();

        let delivery = bus
            .dequeue(ASSEMBLY_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        bus.nack(ASSEMBLY_PIPELINE, &delivery, true).unwrap();

        assert_eq!(bus.depth(ASSEMBLY_PIPELINE.retry).unwrap().pending, 0);
        assert_eq!(bus.depth(ASSEMBLY_PIPELINE.dlq).unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_recovery_republishes_inflight() {
        let (bus, store, _temp) = create_test_bus();
        let job = test_job();
        bus.submit(PROCESS_PIPELINE, job.clone()).unwrap();

        // Dequeue without ack: the message sits inflight, as after a crash
        let delivery = bus
            .dequeue(PROCESS_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bus.depth(PROCESS_PIPELINE.main).unwrap().inflight, 1);
        drop(delivery);
        drop(bus);

        // A new bus over the same database recovers the message
        let recovered_bus = WorkBus::new(store.raw_db(), 3).unwrap();
        let redelivered = recovered_bus
            .dequeue(PROCESS_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.envelope.payload, job);
        recovered_bus.ack(&redelivered).unwrap();
    }

    #[tokio::test]
    async fn test_pump_retries_moves_to_main() {
        let (bus, _store, _temp) = create_test_bus();
        bus.submit(CHUNK_PIPELINE, test_job()).unwrap();

        let delivery = bus
            .dequeue(CHUNK_PIPELINE.main, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        bus.nack(CHUNK_PIPELINE, &delivery, false).unwrap();

        let moved = bus
            .pump_retries(CHUNK_PIPELINE, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(bus.depth(CHUNK_PIPELINE.main).unwrap().pending, 1);
    }
}
