//! Fast per-session chunk index.
//!
//! An ephemeral set service keyed by session id. It is a performance
//! shortcut in front of the authoritative `received` column of the session
//! row: every index update is followed by a persistent database update in
//! the same logical step, so losing the index never loses data.
//!
//! The index knows nothing about sessions; it is a plain set data structure
//! with TTL. The session manager owns the policy. When the index is
//! disabled (config) or marked unavailable, callers take the serialised
//! database fallback instead.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Error returned when the index cannot serve a request
#[derive(Debug, thiserror::Error)]
#[error("chunk index unavailable")]
pub struct IndexUnavailable;

/// One keyed set with its expiry
#[derive(Debug)]
struct Entry {
    members: BTreeSet<u64>,
    expires_at: DateTime<Utc>,
}

/// In-process TTL set service
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    sets: Arc<DashMap<Uuid, Entry>>,
    available: Arc<AtomicBool>,
    ttl: Duration,
}

impl ChunkIndex {
    /// Create a new index; `enabled = false` makes every operation report
    /// unavailable so callers exercise their fallback
    pub fn new(enabled: bool, ttl_seconds: u64) -> Self {
        Self {
            sets: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(enabled)),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    /// Toggle availability at runtime (admin / fault injection)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the index is currently serving requests
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), IndexUnavailable> {
        if self.is_available() {
            Ok(())
        } else {
            Err(IndexUnavailable)
        }
    }

    /// Add a value to the keyed set, refreshing its TTL.
    ///
    /// Returns `(inserted, cardinality)` from a single atomic step, so the
    /// caller that inserts the final member can observe it exactly once.
    pub fn sadd(&self, key: Uuid, value: u64) -> Result<(bool, u64), IndexUnavailable> {
        self.check_available()?;

        let mut entry = self.sets.entry(key).or_insert_with(|| Entry {
            members: BTreeSet::new(),
            expires_at: Utc::now() + self.ttl,
        });

        let inserted = entry.members.insert(value);
        entry.expires_at = Utc::now() + self.ttl;

        Ok((inserted, entry.members.len() as u64))
    }

    /// Cardinality of the keyed set
    pub fn scard(&self, key: Uuid) -> Result<u64, IndexUnavailable> {
        self.check_available()?;
        Ok(self
            .sets
            .get(&key)
            .map(|e| e.members.len() as u64)
            .unwrap_or(0))
    }

    /// Members of the keyed set in ascending order
    pub fn smembers(&self, key: Uuid) -> Result<Vec<u64>, IndexUnavailable> {
        self.check_available()?;
        Ok(self
            .sets
            .get(&key)
            .map(|e| e.members.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Drop the keyed set
    pub fn del(&self, key: Uuid) -> Result<(), IndexUnavailable> {
        self.check_available()?;
        self.sets.remove(&key);
        Ok(())
    }

    /// Refresh the TTL of the keyed set
    pub fn expire(&self, key: Uuid) -> Result<(), IndexUnavailable> {
        self.check_available()?;
        if let Some(mut entry) = self.sets.get_mut(&key) {
            entry.expires_at = Utc::now() + self.ttl;
        }
        Ok(())
    }

    /// Evict expired keys; called periodically by the cleanup task
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sets.len();
        self.sets.retain(|_, entry| entry.expires_at > now);
        let purged = before - self.sets.len();

        if purged > 0 {
            debug!(purged = purged, "Purged expired chunk index keys");
        }

        purged
    }
}
