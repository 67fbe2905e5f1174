//! Bounded result cache with read-time freshness
//!
//! Keeps the last successful payload per (service, operation, args) call
//! identity. Entries store only their write time; the caller decides the
//! acceptable age at read time. That way one entry serves both the normal
//! fresh-read path and the any-age cache_only fallback.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Identity of one cacheable call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub operation: String,
    pub args: String,
}

impl CacheKey {
    pub fn new(service: &str, operation: &str, args: &str) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
            args: args.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service, self.operation, self.args)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// In-memory cache bounded by entry count. Oldest entry is evicted when
/// a new key arrives at capacity, so a misbehaving caller cannot grow
/// the map without limit.
#[derive(Debug)]
pub struct ResultCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Value stored within `ttl`, or None
    pub fn fresh(&self, key: &CacheKey, ttl: Duration) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() <= ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Most recent value regardless of age, with its age
    pub fn any(&self, key: &CacheKey) -> Option<(Value, Duration)> {
        let entry = self.entries.get(key)?;
        Some((entry.value.clone(), entry.stored_at.elapsed()))
    }

    /// Store a value, evicting the oldest entry if the cache is full
    pub fn put(&mut self, key: CacheKey, value: Value) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!("Evicting oldest cache entry {}", key);
            self.entries.remove(&key);
        }
    }
}
