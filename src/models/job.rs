//! Job payloads carried on the work bus.
//!
//! Every message is a `JobEnvelope` wrapping one `Job` payload plus its
//! retry count. The retry count travels inside the envelope so requeueing
//! needs no external state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work item payloads, JSON-serialised on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Promote a temp blob to its canonical chunk key and record receipt
    CommitChunk {
        session_id: Uuid,
        chunk_index: u64,
        temp_key: String,
        owner: String,
    },
    /// Concatenate all chunks of a completed session into the final blob
    AssembleFile { session_id: Uuid, owner: String },
    /// Probe the assembled blob and generate its thumbnail
    ProcessVideo {
        video_id: Uuid,
        storage_key: String,
        owner: String,
    },
}

/// Wire form of a queued message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub payload: Job,
    pub retry_count: u32,
}

impl JobEnvelope {
    /// Wrap a fresh job with zero retries
    pub fn new(payload: Job) -> Self {
        Self {
            payload,
            retry_count: 0,
        }
    }

    /// Copy of this envelope with the retry count incremented
    pub fn next_retry(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            retry_count: self.retry_count + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = JobEnvelope::new(Job::CommitChunk {
            session_id: Uuid::new_v4(),
            chunk_index: 7,
            temp_key: "chunks/temp_1_abc".to_string(),
            owner: "user-1".to_string(),
        });

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_next_retry_increments() {
        let envelope = JobEnvelope::new(Job::AssembleFile {
            session_id: Uuid::new_v4(),
            owner: "user-1".to_string(),
        });

        let retried = envelope.next_retry().next_retry();
        assert_eq!(retried.retry_count, 2);
        assert_eq!(retried.payload, envelope.payload);
    }
}
