//! Redis cache backend.
//!
//! Connections come from a `deadpool-redis` pool. Every public operation
//! goes through a fallible `try_*` helper and degrades on error: reads report
//! a miss, writes report `false`, lock acquisition reports "not acquired".

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

use crate::backend::{CacheBackend, DEFAULT_SCAN_PAGE_SIZE, LockToken, health_check_key};
use crate::error::CacheError;
use crate::keys::lock_key;

/// Compare-and-delete: only the holder of the token may release the lock.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Pool settings for [`RedisBackend::from_url`].
#[derive(Debug, Clone)]
pub struct RedisPoolOptions {
    pub pool_size: usize,
    pub timeout: Duration,
    pub scan_page_size: usize,
}

impl Default for RedisPoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 10,
            timeout: Duration::from_millis(5000),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

/// Redis-backed [`CacheBackend`].
#[derive(Clone, Debug)]
pub struct RedisBackend {
    pool: Pool,
    scan_page_size: usize,
    release_script: redis::Script,
}

impl RedisBackend {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            release_script: redis::Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    /// Build a pool for `url`. No connection is opened until first use.
    pub fn from_url(url: &str, options: &RedisPoolOptions) -> Result<Self, CacheError> {
        let mut config = Config::from_url(url);
        if let Some(ref mut pool_config) = config.pool {
            pool_config.max_size = options.pool_size;
            pool_config.timeouts.wait = Some(options.timeout);
            pool_config.timeouts.create = Some(options.timeout);
            pool_config.timeouts.recycle = Some(options.timeout);
        } else {
            let mut pool_config = deadpool_redis::PoolConfig::new(options.pool_size);
            pool_config.timeouts.wait = Some(options.timeout);
            pool_config.timeouts.create = Some(options.timeout);
            pool_config.timeouts.recycle = Some(options.timeout);
            config.pool = Some(pool_config);
        }
        let pool = config.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self::new(pool).with_scan_page_size(options.scan_page_size))
    }

    /// Number of keys requested per SCAN page.
    pub fn with_scan_page_size(mut self, page_size: usize) -> Self {
        self.scan_page_size = page_size.max(1);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Check that a connection can be checked out.
    pub async fn is_reachable(&self) -> bool {
        self.pool.get().await.is_ok()
    }

    async fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data)
    }

    async fn try_set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.pset_ex(key, value, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn try_delete(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted)
    }

    async fn try_multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn try_multi_set(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let millis = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.pset_ex(key, value.as_slice(), millis).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn try_delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_page_size)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await?;
                total_deleted += deleted.max(0) as u64;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        let mut conn = self.pool.get().await?;
        let token = LockToken::generate();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn try_release_lock(&self, key: &str, token: &LockToken) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .release_script
            .key(lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn try_clear(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn try_health_round_trip(&self) -> Result<bool, CacheError> {
        let nonce = LockToken::generate();
        let key = health_check_key(&nonce);
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(&key, nonce.as_str(), 10).await?;
        let read_back: Option<String> = conn.get(&key).await?;
        let _: i64 = conn.del(&key).await?;
        Ok(read_back.as_deref() == Some(nonce.as_str()))
    }
}

/// Redis rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.try_get(key).await {
            Ok(Some(data)) => {
                tracing::debug!(key = %key, "cache hit");
                crate::metrics::record_cache_hit(self.mode());
                Some(data)
            }
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                crate::metrics::record_cache_miss(self.mode());
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis GET error");
                crate::metrics::record_backend_error("get");
                crate::metrics::record_cache_miss(self.mode());
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        match self.try_set(key, value, ttl).await {
            Ok(()) => {
                tracing::debug!(key = %key, ttl_ms = ttl_millis(ttl), "cache set");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis SET error");
                crate::metrics::record_backend_error("set");
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis DEL error");
                crate::metrics::record_backend_error("delete");
                false
            }
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        match self.try_multi_get(keys).await {
            Ok(values) if values.len() == keys.len() => values,
            Ok(values) => {
                tracing::warn!(
                    expected = keys.len(),
                    received = values.len(),
                    "Redis MGET returned a misaligned reply"
                );
                vec![None; keys.len()]
            }
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "Redis MGET error");
                crate::metrics::record_backend_error("multi_get");
                vec![None; keys.len()]
            }
        }
    }

    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> bool {
        if entries.is_empty() {
            return false;
        }
        match self.try_multi_set(entries, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(count = entries.len(), error = %e, "Redis MSET pipeline error");
                crate::metrics::record_backend_error("multi_set");
                false
            }
        }
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self.try_delete_by_pattern(pattern).await {
            Ok(deleted) => {
                tracing::debug!(pattern = %pattern, deleted, "deleted keys by pattern");
                deleted
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Redis pattern delete error");
                crate::metrics::record_backend_error("delete_by_pattern");
                0
            }
        }
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        match self.try_acquire_lock(key, ttl).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis lock acquire error");
                crate::metrics::record_backend_error("acquire_lock");
                None
            }
        }
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> bool {
        match self.try_release_lock(key, token).await {
            Ok(removed) => {
                if removed == 0 {
                    tracing::debug!(key = %key, "lock already expired or taken over");
                }
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis lock release error");
                crate::metrics::record_backend_error("release_lock");
                false
            }
        }
    }

    async fn clear(&self) -> bool {
        match self.try_clear().await {
            Ok(()) => {
                tracing::info!("redis cache flushed");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis FLUSHDB error");
                crate::metrics::record_backend_error("clear");
                false
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        match self.try_health_round_trip().await {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::warn!(error = %e, "Redis health check failed");
                false
            }
        }
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_backend() -> RedisBackend {
        // Nothing listens on port 1; connections are refused immediately.
        RedisBackend::from_url(
            "redis://127.0.0.1:1",
            &RedisPoolOptions {
                pool_size: 2,
                timeout: Duration::from_millis(500),
                scan_page_size: 10,
            },
        )
        .expect("pool config")
    }

    #[test]
    fn ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
    }

    #[tokio::test]
    async fn reads_fail_open_when_unreachable() {
        let cache = unreachable_backend();
        assert_eq!(cache.get("k").await, None);
        assert_eq!(
            cache.multi_get(&["a".into(), "b".into()]).await,
            vec![None, None]
        );
        assert_eq!(cache.delete_by_pattern("products:v1:list:*").await, 0);
    }

    #[tokio::test]
    async fn writes_report_failure_when_unreachable() {
        let cache = unreachable_backend();
        assert!(!cache.set("k", b"v", Duration::from_secs(5)).await);
        assert!(!cache.delete("k").await);
        assert!(
            !cache
                .multi_set(&[("k".into(), b"v".to_vec())], Duration::from_secs(5))
                .await
        );
        assert!(!cache.clear().await);
    }

    #[tokio::test]
    async fn locking_fails_closed_when_unreachable() {
        let cache = unreachable_backend();
        assert!(cache.acquire_lock("k", Duration::from_secs(5)).await.is_none());
        assert!(!cache.release_lock("k", &LockToken::generate()).await);
        assert!(!cache.is_healthy().await);
        assert!(!cache.is_reachable().await);
    }
}
