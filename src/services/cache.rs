//! Listing cache.
//!
//! A small TTL cache in front of listing/search style reads. The cache is
//! an accelerator only: every operation is infallible from the caller's
//! point of view, a miss or an internal problem just means "not cached".
//! Assembly and post-processing invalidate the entries tied to a session
//! owner or a video category.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedValue {
    body: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// In-process TTL cache for listing responses
#[derive(Debug, Clone)]
pub struct ListingCache {
    entries: Arc<DashMap<String, CachedValue>>,
    ttl: Duration,
}

impl ListingCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    /// Cached value for a key, if fresh
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if entry.expires_at < Utc::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.body.clone())
    }

    /// Store a value under a key
    pub fn put(&self, key: &str, body: serde_json::Value) {
        self.entries.insert(
            key.to_string(),
            CachedValue {
                body,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    /// Drop one key
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every key starting with a prefix (e.g. all pages of one owner's
    /// session listing, or all listings of one category)
    pub fn invalidate_prefix(&self, prefix: &str) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(prefix = prefix, removed = removed, "Invalidated cache entries");
        }
    }

    /// Key for an owner's session listing page
    pub fn sessions_key(owner: &str, page: usize, limit: usize) -> String {
        format!("sessions:{}:{}:{}", owner, page, limit)
    }

    /// Prefix covering every cached page of one owner's session listing
    pub fn sessions_prefix(owner: &str) -> String {
        format!("sessions:{}:", owner)
    }

    /// Prefix covering listings of one video category
    pub fn category_prefix(category: &str) -> String {
        format!("videos:{}:", category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_invalidate() {
        let cache = ListingCache::new(60);
        cache.put("sessions:u1:1:10", json!({"sessions": []}));

        assert!(cache.get("sessions:u1:1:10").is_some());
        cache.invalidate("sessions:u1:1:10");
        assert!(cache.get("sessions:u1:1:10").is_none());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = ListingCache::new(60);
        cache.put("sessions:u1:1:10", json!(1));
        cache.put("sessions:u1:2:10", json!(2));
        cache.put("sessions:u2:1:10", json!(3));

        cache.invalidate_prefix(&ListingCache::sessions_prefix("u1"));

        assert!(cache.get("sessions:u1:1:10").is_none());
        assert!(cache.get("sessions:u1:2:10").is_none());
        assert!(cache.get("sessions:u2:1:10").is_some());
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = ListingCache::new(0);
        cache.put("k", json!(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }
}
