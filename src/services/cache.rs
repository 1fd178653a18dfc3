use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A time-bounded key/value store with a fixed freshness window.
///
/// Staleness is evaluated on every read; stale entries are left in place
/// rather than purged, so memory grows with distinct keys until `clear()`.
/// Concurrent writers to the same key are last-write-wins.
pub struct DataCache<T> {
    data: DashMap<String, CachedData<T>>,
    freshness: Duration,
}

struct CachedData<T> {
    data: T,
    stored_at: Instant,
}

impl<T: Clone> DataCache<T> {
    /// Create a cache whose entries are fresh for `freshness` after each set.
    pub fn new(freshness: Duration) -> Self {
        Self {
            data: DashMap::new(),
            freshness,
        }
    }

    /// Store a value under `key`, unconditionally overwriting.
    pub fn set(&self, key: &str, data: T) {
        self.data.insert(
            key.to_string(),
            CachedData {
                data,
                stored_at: Instant::now(),
            },
        );
    }

    /// Get the value for `key` if it is still within the freshness window.
    pub fn get(&self, key: &str) -> Option<T> {
        let entry = self.data.get(key)?;
        if entry.stored_at.elapsed() <= self.freshness {
            Some(entry.data.clone())
        } else {
            None
        }
    }

    /// Freshness check without returning the value.
    pub fn has(&self, key: &str) -> bool {
        self.data
            .get(key)
            .map(|entry| entry.stored_at.elapsed() <= self.freshness)
            .unwrap_or(false)
    }

    /// Get the value together with its age, regardless of freshness.
    /// Used for diagnostics and fallback-blend decisions.
    pub fn get_with_age(&self, key: &str) -> Option<(T, Duration)> {
        let entry = self.data.get(key)?;
        Some((entry.data.clone(), entry.stored_at.elapsed()))
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Number of entries, stale included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
