//! Cache backend selection at startup.
//!
//! ## Cache Modes
//!
//! - **Redis disabled**: in-process cache only
//! - **Redis enabled**: build a pool and wait until a health round-trip
//!   succeeds, retrying with exponential backoff. When retries run out the
//!   service falls back to the in-process cache if `fallback_to_local` is
//!   set, otherwise startup fails.
//!
//! One-shot admin commands use [`connect_shared_cache`] instead: one
//! round-trip, no fallback, so they act on the shared cache or fail.

use std::sync::Arc;
use std::time::Duration;

use catalog_cache::{CacheBackend, CacheError, LocalBackend, RedisBackend};

use crate::config::{CacheConfig, RedisConfig};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Redis pool could not be created: {0}")]
    Pool(#[from] CacheError),

    #[error("Redis at {url} not healthy after {attempts} attempts")]
    Unreachable { url: String, attempts: u32 },

    #[error("Redis is disabled; the in-process cache lives inside the running server")]
    Disabled,

    #[error("FLUSHDB on {url} failed")]
    FlushFailed { url: String },
}

/// The backend chosen at startup.
#[derive(Clone)]
pub enum SelectedBackend {
    Redis(RedisBackend),
    Local(LocalBackend),
}

impl SelectedBackend {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Redis(redis) => redis.mode(),
            Self::Local(local) => local.mode(),
        }
    }

    /// The in-process store, when that is what was selected.
    pub fn local(&self) -> Option<&LocalBackend> {
        match self {
            Self::Local(local) => Some(local),
            Self::Redis(_) => None,
        }
    }

    pub fn into_shared(self) -> Arc<dyn CacheBackend> {
        match self {
            Self::Redis(redis) => Arc::new(redis),
            Self::Local(local) => Arc::new(local),
        }
    }
}

impl std::fmt::Debug for SelectedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SelectedBackend").field(&self.mode()).finish()
    }
}

/// Create the cache backend described by `redis`.
pub async fn create_cache_backend(
    redis: &RedisConfig,
    cache: &CacheConfig,
) -> Result<SelectedBackend, BootstrapError> {
    if !redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return Ok(SelectedBackend::Local(LocalBackend::new()));
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let backend = match RedisBackend::from_url(&redis.url, &redis.pool_options(cache.scan_page_size)) {
        Ok(backend) => backend,
        Err(e) if redis.fallback_to_local => {
            tracing::warn!(error = %e, "Failed to create Redis pool. Falling back to local cache.");
            return Ok(SelectedBackend::Local(LocalBackend::new()));
        }
        Err(e) => return Err(e.into()),
    };

    if wait_until_healthy(&backend, redis).await {
        tracing::info!("Connected to Redis");
        return Ok(SelectedBackend::Redis(backend));
    }

    if redis.fallback_to_local {
        tracing::warn!(
            url = %redis.url,
            attempts = redis.max_retries,
            "Redis never became healthy. Falling back to local cache."
        );
        Ok(SelectedBackend::Local(LocalBackend::new()))
    } else {
        Err(BootstrapError::Unreachable {
            url: redis.url.clone(),
            attempts: redis.max_retries,
        })
    }
}

/// Connect to the shared Redis cache for an admin command.
///
/// Makes a single health round-trip and never substitutes the in-process
/// cache, whatever `fallback_to_local` says.
pub async fn connect_shared_cache(
    redis: &RedisConfig,
    cache: &CacheConfig,
) -> Result<RedisBackend, BootstrapError> {
    if !redis.enabled {
        return Err(BootstrapError::Disabled);
    }
    let backend = RedisBackend::from_url(&redis.url, &redis.pool_options(cache.scan_page_size))?;
    if !backend.is_healthy().await {
        return Err(BootstrapError::Unreachable {
            url: redis.url.clone(),
            attempts: 1,
        });
    }
    Ok(backend)
}

/// Drop every entry from the shared Redis cache.
pub async fn flush_shared_cache(
    redis: &RedisConfig,
    cache: &CacheConfig,
) -> Result<(), BootstrapError> {
    let backend = connect_shared_cache(redis, cache).await?;
    if !backend.clear().await {
        return Err(BootstrapError::FlushFailed {
            url: redis.url.clone(),
        });
    }
    tracing::info!(url = %redis.url, "shared cache flushed");
    Ok(())
}

/// Health round-trips with exponential backoff.
///
/// Returns `true` as soon as one succeeds. At least one attempt is made.
pub async fn wait_until_healthy(backend: &dyn CacheBackend, redis: &RedisConfig) -> bool {
    let attempts = redis.max_retries.max(1);
    let mut delays = backoff_schedule(redis.initial_backoff(), redis.max_backoff());
    for attempt in 1..=attempts {
        if backend.is_healthy().await {
            return true;
        }
        if attempt == attempts {
            tracing::error!(attempts, "Failed to connect to Redis after max retries");
            break;
        }
        let delay = delays.next().unwrap_or(redis.max_backoff());
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Redis not ready, retrying"
        );
        tokio::time::sleep(delay).await;
    }
    false
}

/// Delays starting at `initial` and doubling, capped at `max`.
pub fn backoff_schedule(initial: Duration, max: Duration) -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(initial.min(max)), move |delay| {
        Some(delay.saturating_mul(2).min(max))
    })
}

/// Periodically evict expired entries from the in-process cache and publish
/// its size.
pub fn spawn_local_maintenance(
    local: LocalBackend,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = local.cleanup_expired();
            let stats = local.stats();
            if evicted > 0 {
                tracing::debug!(evicted, entries = stats.entries, "evicted expired cache entries");
            }
            crate::metrics::set_cache_entries(local.mode(), stats.entries);
        }
    })
}
