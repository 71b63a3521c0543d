//! Optional TTL key-value cache collaborator.
//!
//! The cache only ever trades latency for memory: every read path works
//! identically (if more slowly) when the cache is absent or cold. Keys use
//! well-known prefixes so whole families can be invalidated together:
//!
//! | Prefix | Cached |
//! |--------|--------|
//! | `entity:` | Entity lookups |
//! | `community:` | Community digests and summaries |
//! | `query:` | Full query answers |
//! | `retrieval:` | Retrieval envelopes |

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key prefix for entity lookups.
pub const ENTITY_PREFIX: &str = "entity:";
/// Key prefix for community data.
pub const COMMUNITY_PREFIX: &str = "community:";
/// Key prefix for query answers.
pub const QUERY_PREFIX: &str = "query:";
/// Key prefix for retrieval envelopes.
pub const RETRIEVAL_PREFIX: &str = "retrieval:";

/// TTL key-value cache contract.
pub trait Cache: Send + Sync {
    /// Fetches a live value.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores a value with an optional TTL.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Removes one key. Returns whether it existed.
    fn delete(&self, key: &str) -> bool;

    /// Removes every key under a prefix. Returns how many were dropped.
    fn clear_by_prefix(&self, prefix: &str) -> usize;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| Instant::now() < deadline)
    }
}

/// In-process LRU cache with per-entry expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    /// Default capacity.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Creates a cache with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a cache bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.is_live() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            },
            None => None,
        }
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(key.to_string(), entry);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop(key)
            .is_some()
    }

    fn clear_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("entity:alice", "data".to_string(), None);
        assert_eq!(cache.get("entity:alice"), Some("data".to_string()));
        assert!(cache.delete("entity:alice"));
        assert!(cache.get("entity:alice").is_none());
        assert!(!cache.delete("entity:alice"));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache.set(
            "query:q1",
            "answer".to_string(),
            Some(Duration::from_millis(10)),
        );
        assert!(cache.get("query:q1").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("query:q1").is_none());
    }

    #[test]
    fn test_clear_by_prefix() {
        let cache = MemoryCache::new();
        cache.set("entity:a", "1".to_string(), None);
        cache.set("entity:b", "2".to_string(), None);
        cache.set("community:1", "3".to_string(), None);

        assert_eq!(cache.clear_by_prefix(ENTITY_PREFIX), 2);
        assert!(cache.get("entity:a").is_none());
        assert_eq!(cache.get("community:1"), Some("3".to_string()));
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.set("c", "3".to_string(), None);
        assert!(cache.get("a").is_none(), "oldest entry evicted");
        assert!(cache.get("c").is_some());
    }
}
