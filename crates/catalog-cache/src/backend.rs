//! Cache backend contract.
//!
//! The coordinator and the invalidation engine only talk to the shared cache
//! through [`CacheBackend`]. Two implementations ship with the crate:
//!
//! - [`LocalBackend`](crate::local::LocalBackend): in-process DashMap, for
//!   single-instance deployments, fallback and tests
//! - [`RedisBackend`](crate::redis_backend::RedisBackend): shared across
//!   instances
//!
//! ## Failure Semantics
//!
//! The cache is an optimization, not a source of truth. Every read and write
//! is fail-open: a backend error is logged and reported as a miss, `false` or
//! `0`, never as an error. Lock acquisition is fail-closed: an error means
//! "not acquired".

use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheError;

/// Prefix of the keys written by health round-trips.
pub const HEALTH_CHECK_PREFIX: &str = "health:check:";

/// Key for one health round-trip. Each check gets its own key so
/// overlapping checks never read each other's value.
pub fn health_check_key(nonce: &LockToken) -> String {
    format!("{HEALTH_CHECK_PREFIX}{}", nonce.as_str())
}

/// Default page size for SCAN-based pattern deletes.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Proof of lock ownership.
///
/// Release is a compare-and-delete on this token, so a holder whose lock
/// already expired cannot release a lock acquired by someone else since.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// A fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Byte-oriented cache backend with TTL support.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value. `None` on miss or on backend failure.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Set a value with TTL. Returns `false` if the write did not happen.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool;

    /// Delete a key. Returns `false` only on backend failure.
    async fn delete(&self, key: &str) -> bool;

    /// Get many values. The result is aligned with `keys`.
    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>>;

    /// Set many values sharing one TTL.
    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> bool;

    /// Delete every key matching a glob pattern, in bounded pages.
    ///
    /// Returns the number of keys deleted.
    async fn delete_by_pattern(&self, pattern: &str) -> u64;

    /// Atomically take the lock guarding `key` for at most `ttl`.
    ///
    /// Returns `None` if the lock is held elsewhere or the backend failed.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Option<LockToken>;

    /// Release the lock guarding `key` if `token` still owns it.
    ///
    /// Idempotent. Returns `false` only on backend failure.
    async fn release_lock(&self, key: &str, token: &LockToken) -> bool;

    /// Drop every key. Administrative use only.
    async fn clear(&self) -> bool;

    /// Write, read back and delete a sentinel key.
    async fn is_healthy(&self) -> bool;

    /// Short backend name for logs and metrics.
    fn mode(&self) -> &'static str;
}

/// JSON helpers on top of the byte-oriented contract.
#[async_trait]
pub trait CacheBackendExt: CacheBackend {
    /// Get and decode a JSON payload.
    ///
    /// A payload that does not decode is treated as a miss.
    async fn get_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let data = self.get(key).await?;
        match serde_json::from_slice::<T>(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to decode cached payload");
                crate::metrics::record_backend_error("decode");
                None
            }
        }
    }

    /// Encode and store a JSON payload.
    async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration) -> bool
    where
        T: Serialize + Sync,
    {
        match serde_json::to_vec(value) {
            Ok(data) => self.set(key, &data, ttl).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode payload for cache");
                crate::metrics::record_backend_error("encode");
                false
            }
        }
    }
}

impl<B: CacheBackend + ?Sized> CacheBackendExt for B {}

/// Compile a Redis-style glob (`*`, `?`, `[...]`, `\` escapes) for matching
/// keys in process.
pub(crate) fn compile_key_pattern(pattern: &str) -> Result<GlobMatcher, CacheError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| CacheError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_suffixes() {
        let glob = compile_key_pattern("products:v1:list:*").unwrap();
        assert!(glob.is_match("products:v1:list:limit=20:offset=0:sort=name_asc:name="));
        assert!(glob.is_match("products:v1:list:"));
        assert!(!glob.is_match("products:v1:item:p1"));
        assert!(!glob.is_match("xproducts:v1:list:a"));
    }

    #[test]
    fn star_crosses_slashes_in_keys() {
        let glob = compile_key_pattern("products:v1:list:*").unwrap();
        assert!(glob.is_match("products:v1:list:name=a%2Fb/c"));
    }

    #[test]
    fn glob_literals_are_literal() {
        let glob = compile_key_pattern("a.b+c").unwrap();
        assert!(glob.is_match("a.b+c"));
        assert!(!glob.is_match("aXb+c"));
    }

    #[test]
    fn glob_question_mark_and_class() {
        let glob = compile_key_pattern("key?[ab]").unwrap();
        assert!(glob.is_match("key1a"));
        assert!(glob.is_match("keyXb"));
        assert!(!glob.is_match("key1c"));

        let glob = compile_key_pattern("v[0-9]").unwrap();
        assert!(glob.is_match("v7"));
        assert!(!glob.is_match("vx"));
    }

    #[test]
    fn glob_escaped_star_is_literal() {
        let glob = compile_key_pattern(r"a\*").unwrap();
        assert!(glob.is_match("a*"));
        assert!(!glob.is_match("abc"));
    }

    #[test]
    fn closing_bracket_first_in_class_is_literal() {
        let glob = compile_key_pattern("a[]]").unwrap();
        assert!(glob.is_match("a]"));
        assert!(!glob.is_match("a\\"));
    }

    #[test]
    fn unclosed_class_is_rejected() {
        assert!(matches!(
            compile_key_pattern("a[bc"),
            Err(CacheError::Pattern { .. })
        ));
    }

    #[test]
    fn concurrent_health_checks_use_distinct_keys() {
        let a = health_check_key(&LockToken::generate());
        let b = health_check_key(&LockToken::generate());
        assert!(a.starts_with(HEALTH_CHECK_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn lock_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }
}
