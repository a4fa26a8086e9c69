//! Time-bounded cache of secret store lookups.
//!
//! Stores both confirmed secrets and confirmed absences, so unknown key ids
//! don't trigger a remote lookup on every request. Entries expire after
//! `ttl_seconds` and are dropped lazily on the next read; [`SecretCache::evict_expired`]
//! reclaims memory for entries nobody reads again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::clock::Clock;

/// Cached lookup result.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// `None` records that the store had no such secret.
    pub value: Option<String>,
    /// Entry is usable while `now < expires_at`.
    pub expires_at: Instant,
}

/// Result of a cache read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Miss,
    /// Hit, carrying the cached value or a cached absence.
    Hit(Option<String>),
}

/// Thread-safe secret cache with TTL.
pub struct SecretCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CacheEntry>,
}

impl SecretCache {
    /// Create a cache. A TTL of zero disables caching.
    pub fn new(ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds),
            clock,
            entries: DashMap::new(),
        }
    }

    fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Look up a secret name, dropping the entry if it has expired.
    pub fn get(&self, name: &str) -> CacheLookup {
        if !self.enabled() {
            return CacheLookup::Miss;
        }
        let now = self.clock.now();

        match self.entries.get(name) {
            None => return CacheLookup::Miss,
            Some(entry) if now < entry.expires_at => return CacheLookup::Hit(entry.value.clone()),
            Some(_) => {}
        }

        // Another writer may have refreshed the entry in between; only remove it if still stale.
        self.entries.remove_if(name, |_, entry| entry.expires_at <= now);
        CacheLookup::Miss
    }

    /// Store a lookup result, replacing any previous entry.
    pub fn set(&self, name: &str, value: Option<String>) {
        if !self.enabled() {
            return;
        }
        let entry = CacheEntry {
            value,
            expires_at: self.clock.now() + self.ttl,
        };
        self.entries.insert(name.to_string(), entry);
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
