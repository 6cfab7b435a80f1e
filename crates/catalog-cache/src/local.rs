//! In-process cache backend.
//!
//! Used when Redis is disabled or unreachable, and as the backend of choice
//! in tests. Entries and locks expire lazily on access; `cleanup_expired`
//! sweeps the rest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::backend::{CacheBackend, LockToken, compile_key_pattern, health_check_key};
use crate::keys::lock_key;

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so that hits clone a pointer, not the payload.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

#[derive(Debug)]
struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

/// Local cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStats {
    pub entries: usize,
    pub locks: usize,
}

/// DashMap-backed [`CacheBackend`].
///
/// Cloning shares the underlying maps, so clones behave like several
/// connections to one store.
#[derive(Clone, Debug, Default)]
pub struct LocalBackend {
    entries: Arc<DashMap<String, CachedEntry>>,
    locks: Arc<DashMap<String, HeldLock>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of stored entries and locks, expired ones included.
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.entries.len(),
            locks: self.locks.len(),
        }
    }

    /// Remove expired entries and locks. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.locks.retain(|_, lock| {
            if lock.expires_at <= now {
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    fn get_live(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(Arc::clone(&entry.data));
            }
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }
}

#[async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let result = self.get_live(key).map(|data| data.as_ref().clone());
        if result.is_some() {
            crate::metrics::record_cache_hit(self.mode());
        } else {
            crate::metrics::record_cache_miss(self.mode());
        }
        result
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value.to_vec(), ttl));
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (local)");
        true
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key);
        tracing::debug!(key = %key, "cache delete (local)");
        true
    }

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        keys.iter()
            .map(|key| self.get_live(key).map(|data| data.as_ref().clone()))
            .collect()
    }

    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> bool {
        for (key, value) in entries {
            self.entries
                .insert(key.clone(), CachedEntry::new(value.clone(), ttl));
        }
        true
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let matcher = match compile_key_pattern(pattern) {
            Ok(matcher) => matcher,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "pattern delete skipped");
                return 0;
            }
        };

        let mut deleted = 0;
        self.entries.retain(|key, _| {
            if matcher.is_match(key.as_str()) {
                deleted += 1;
                false
            } else {
                true
            }
        });

        tracing::debug!(pattern = %pattern, deleted, "deleted keys by pattern (local)");
        deleted
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Instant::now();
        match self.locks.entry(lock_key(key)) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return None;
                }
                let token = LockToken::generate();
                held.insert(HeldLock {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
                Some(token)
            }
            Entry::Vacant(slot) => {
                let token = LockToken::generate();
                slot.insert(HeldLock {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
                Some(token)
            }
        }
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> bool {
        self.locks
            .remove_if(&lock_key(key), |_, held| &held.token == token);
        true
    }

    async fn clear(&self) -> bool {
        self.entries.clear();
        self.locks.clear();
        tracing::info!("local cache cleared");
        true
    }

    async fn is_healthy(&self) -> bool {
        let nonce = LockToken::generate();
        let key = health_check_key(&nonce);
        if !self
            .set(&key, nonce.as_str().as_bytes(), Duration::from_secs(10))
            .await
        {
            return false;
        }
        let read_back = self.get_live(&key);
        self.entries.remove(&key);
        read_back.is_some_and(|data| data.as_slice() == nonce.as_str().as_bytes())
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}
