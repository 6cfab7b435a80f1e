//! Stampede-protected read-through.
//!
//! ## Read Path
//!
//! ```text
//! get_json(key) ──hit──────────────────────────────────────────▶ Cache
//!      │ miss
//!      ▼
//! in-flight table ──pending──▶ await shared handle ────────────▶ Coalesced
//!      │ none: register, spawn fetch task
//!      ▼
//! acquire_lock ──held elsewhere──▶ (optional wait for peer write-back) ──▶ Peer
//!      │                                  │ nothing appeared
//!      ▼                                  ▼
//! origin fetch ──▶ write-back on Some ──▶ cleanup ─────────────▶ Origin
//! ```
//!
//! Within one process at most one origin fetch per key is in flight. Across
//! processes the lock only lowers the odds of duplicate fetches: a caller
//! that finds the lock taken and no local fetch still fetches, because the
//! cache is advisory and a duplicate fetch costs latency, not correctness.
//!
//! The fetch runs on its own task. A caller that goes away does not cancel
//! it; the write-back still lands for the next caller.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::backend::{CacheBackend, CacheBackendExt};
use crate::error::OriginError;
use crate::inflight::{
    FetchOutcome, Fetched, InFlightFuture, InFlightGuard, InFlightTable, SharedValue, Slot,
};
use crate::keys::CacheKey;

/// Tuning for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// How long a fetch lock lives if its holder never releases it.
    pub lock_ttl: Duration,
    /// How long to wait for another process's write-back when the lock is
    /// taken. Zero fetches immediately.
    pub lock_wait: Duration,
    /// Cache polling interval while waiting on another process.
    pub lock_poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::ZERO,
            lock_poll_interval: Duration::from_millis(25),
        }
    }
}

/// Where a read-through result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadSource {
    /// Served from the shared cache.
    Cache,
    /// This caller ran the origin fetch.
    Origin,
    /// This caller awaited a fetch started by another caller.
    Coalesced,
    /// Another process held the fetch lock; its write-back was read from
    /// the cache while waiting.
    Peer,
}

impl ReadSource {
    pub fn is_cached(&self) -> bool {
        matches!(self, ReadSource::Cache | ReadSource::Peer)
    }
}

/// Outcome of [`CacheCoordinator::read_through`].
///
/// `value` is `None` when the origin reports that the entity does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadThrough<T> {
    pub value: Option<T>,
    pub source: ReadSource,
}

/// Read-through cache coordinator.
///
/// Cheap to clone: clones share the backend and the in-flight table.
#[derive(Clone)]
pub struct CacheCoordinator {
    backend: Arc<dyn CacheBackend>,
    in_flight: Arc<InFlightTable>,
    options: CoordinatorOptions,
}

impl CacheCoordinator {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_options(backend, CoordinatorOptions::default())
    }

    pub fn with_options(backend: Arc<dyn CacheBackend>, options: CoordinatorOptions) -> Self {
        Self {
            backend,
            in_flight: Arc::new(InFlightTable::new()),
            options,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn in_flight(&self) -> &InFlightTable {
        &self.in_flight
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Serve `key` from the cache, or fetch it once and write it back.
    ///
    /// `fetch` is only invoked when this caller becomes the fetcher. Its
    /// `Ok(None)` means "not found" and is never cached; its errors are
    /// returned to every caller waiting on this fetch and are never cached
    /// either.
    pub async fn read_through<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<ReadThrough<T>, OriginError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, OriginError>> + Send + 'static,
    {
        if let Some(value) = self.backend.get_json::<T>(key.as_str()).await {
            return Ok(ReadThrough {
                value: Some(value),
                source: ReadSource::Cache,
            });
        }

        let slot = self.in_flight.join_or_start(key.as_str(), |generation| {
            self.spawn_fetch::<T, Fut>(key, ttl, fetch(), generation)
        });
        let (pending, leader) = match slot {
            Slot::Leader(pending) => (pending, true),
            Slot::Joined(pending) => {
                tracing::debug!(key = %key, "joined in-flight fetch");
                crate::metrics::record_coalesced();
                (pending, false)
            }
        };

        let Some(fetched) = pending.await? else {
            let source = if leader {
                ReadSource::Origin
            } else {
                ReadSource::Coalesced
            };
            return Ok(ReadThrough {
                value: None,
                source,
            });
        };
        let source = match (leader, fetched.from_peer) {
            (false, _) => ReadSource::Coalesced,
            (true, true) => ReadSource::Peer,
            (true, false) => ReadSource::Origin,
        };
        match fetched.value.downcast::<T>() {
            Ok(value) => Ok(ReadThrough {
                value: Some(Arc::unwrap_or_clone(value)),
                source,
            }),
            Err(_) => {
                tracing::error!(
                    key = %key,
                    expected = std::any::type_name::<T>(),
                    "in-flight fetch produced a different type for this key"
                );
                Err(OriginError::query(format!(
                    "cache key {key} is shared by incompatible value types"
                )))
            }
        }
    }

    fn spawn_fetch<T, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: Fut,
        generation: u64,
    ) -> InFlightFuture
    where
        T: Serialize + Send + Sync + DeserializeOwned + 'static,
        Fut: Future<Output = Result<Option<T>, OriginError>> + Send + 'static,
    {
        let task = FetchTask {
            backend: Arc::clone(&self.backend),
            guard: InFlightGuard::new(
                Arc::clone(&self.in_flight),
                key.as_str().to_string(),
                generation,
            ),
            key: key.as_str().to_string(),
            ttl,
            options: self.options.clone(),
        };
        let handle = tokio::spawn(task.run(fetch));

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(OriginError::aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("backend", &self.backend.mode())
            .field("in_flight", &self.in_flight)
            .field("options", &self.options)
            .finish()
    }
}

/// Everything one spawned fetch needs, owned.
struct FetchTask {
    backend: Arc<dyn CacheBackend>,
    guard: InFlightGuard,
    key: String,
    ttl: Duration,
    options: CoordinatorOptions,
}

impl FetchTask {
    async fn run<T, Fut>(self, fetch: Fut) -> FetchOutcome
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, OriginError>> + Send + 'static,
    {
        let FetchTask {
            backend,
            guard,
            key,
            ttl,
            options,
        } = self;

        let lock = backend.acquire_lock(&key, options.lock_ttl).await;
        if lock.is_none() {
            crate::metrics::record_lock_contention();
            tracing::debug!(key = %key, "fetch lock held elsewhere");
            if let Some(value) = wait_for_peer::<T>(backend.as_ref(), &key, &options).await {
                drop(guard);
                return Ok(Some(Fetched {
                    value: Arc::new(value) as SharedValue,
                    from_peer: true,
                }));
            }
        }

        let outcome = match AssertUnwindSafe(fetch).catch_unwind().await {
            Ok(Ok(Some(value))) => {
                crate::metrics::record_origin_fetch("found");
                if !backend.set_json(&key, &value, ttl).await {
                    tracing::debug!(key = %key, "write-back skipped, cache unavailable");
                }
                Ok(Some(Fetched {
                    value: Arc::new(value) as SharedValue,
                    from_peer: false,
                }))
            }
            Ok(Ok(None)) => {
                crate::metrics::record_origin_fetch("not_found");
                Ok(None)
            }
            Ok(Err(e)) => {
                crate::metrics::record_origin_fetch("error");
                tracing::warn!(key = %key, error = %e, "origin fetch failed");
                Err(e)
            }
            Err(panic) => {
                crate::metrics::record_origin_fetch("error");
                let message = panic_message(panic.as_ref());
                tracing::error!(key = %key, panic = %message, "origin fetch panicked");
                Err(OriginError::aborted(message))
            }
        };

        // The write-back has landed: later callers either hit the cache or
        // start a fresh fetch.
        drop(guard);

        if let Some(token) = lock {
            if !backend.release_lock(&key, &token).await {
                tracing::warn!(
                    key = %key,
                    lock_ttl_ms = options.lock_ttl.as_millis() as u64,
                    "lock release failed, relying on expiry"
                );
            }
        }

        outcome
    }
}

/// Poll the cache while another process holds the fetch lock.
async fn wait_for_peer<T>(
    backend: &dyn CacheBackend,
    key: &str,
    options: &CoordinatorOptions,
) -> Option<T>
where
    T: DeserializeOwned + Send,
{
    if options.lock_wait.is_zero() {
        return None;
    }
    let deadline = Instant::now() + options.lock_wait;
    while Instant::now() < deadline {
        tokio::time::sleep(options.lock_poll_interval).await;
        if let Some(value) = backend.get_json::<T>(key).await {
            tracing::debug!(key = %key, "peer write-back observed");
            return Some(value);
        }
    }
    tracing::debug!(key = %key, "no peer write-back, fetching as fallback");
    None
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "origin fetch panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn unreachable_origin<T>() -> Result<Option<T>, OriginError> {
        panic!("origin must not be called")
    }

    async fn exploding_origin() -> Result<Option<u32>, OriginError> {
        panic!("origin exploded")
    }

    fn coordinator() -> (CacheCoordinator, LocalBackend) {
        let backend = LocalBackend::new();
        (CacheCoordinator::new(Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn miss_fetches_and_populates() {
        let (coordinator, backend) = coordinator();
        let key = CacheKey::from_raw("products:v1:item:p1");

        let first = coordinator
            .read_through(&key, Duration::from_secs(60), || async {
                Ok::<_, OriginError>(Some("lamp".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(first.value.as_deref(), Some("lamp"));
        assert_eq!(first.source, ReadSource::Origin);
        assert_eq!(
            backend.get_json::<String>(key.as_str()).await.as_deref(),
            Some("lamp")
        );

        let second = coordinator
            .read_through(&key, Duration::from_secs(60), unreachable_origin::<String>)
            .await
            .unwrap();
        assert_eq!(second.source, ReadSource::Cache);
        assert_eq!(second.value.as_deref(), Some("lamp"));
    }

    #[tokio::test]
    async fn not_found_is_not_cached() {
        let (coordinator, backend) = coordinator();
        let key = CacheKey::from_raw("products:v1:item:missing");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = coordinator
                .read_through::<String, _, _>(&key, Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<String>, OriginError>(None)
                })
                .await
                .unwrap();
            assert_eq!(result.value, None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.get(key.as_str()).await, None);
    }

    #[tokio::test]
    async fn lock_is_released_after_fetch() {
        let (coordinator, backend) = coordinator();
        let key = CacheKey::from_raw("products:v1:item:p2");

        coordinator
            .read_through(&key, Duration::from_secs(60), || async {
                Ok::<_, OriginError>(Some(1u32))
            })
            .await
            .unwrap();

        assert!(
            backend
                .acquire_lock(key.as_str(), Duration::from_secs(1))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn panicking_fetch_is_reported_and_cleaned_up() {
        let (coordinator, _backend) = coordinator();
        let key = CacheKey::from_raw("products:v1:item:boom");

        let err = coordinator
            .read_through(&key, Duration::from_secs(60), exploding_origin)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert!(err.to_string().contains("origin exploded"));
        assert!(coordinator.in_flight().is_empty());

        let retried = coordinator
            .read_through(&key, Duration::from_secs(60), || async {
                Ok::<_, OriginError>(Some(7u32))
            })
            .await
            .unwrap();
        assert_eq!(retried.value, Some(7));
    }

    #[tokio::test]
    async fn contended_lock_waits_for_peer_write_back() {
        let backend = LocalBackend::new();
        let coordinator = CacheCoordinator::with_options(
            Arc::new(backend.clone()),
            CoordinatorOptions {
                lock_wait: Duration::from_millis(500),
                lock_poll_interval: Duration::from_millis(10),
                ..CoordinatorOptions::default()
            },
        );
        let key = CacheKey::from_raw("products:v1:item:peer");

        // Another process holds the lock and writes back shortly after.
        let peer_token = backend
            .acquire_lock(key.as_str(), Duration::from_secs(5))
            .await
            .unwrap();
        let peer = backend.clone();
        let peer_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.set_json(peer_key.as_str(), &"from-peer".to_string(), Duration::from_secs(60))
                .await;
            peer.release_lock(peer_key.as_str(), &peer_token).await;
        });

        let result = coordinator
            .read_through(&key, Duration::from_secs(60), unreachable_origin::<String>)
            .await
            .unwrap();
        assert_eq!(result.value.as_deref(), Some("from-peer"));
        assert_eq!(result.source, ReadSource::Peer);
        assert!(result.source.is_cached());
    }

    #[tokio::test]
    async fn contended_lock_without_wait_falls_back_to_fetch() {
        let (coordinator, backend) = coordinator();
        let key = CacheKey::from_raw("products:v1:item:fallback");
        let _held = backend
            .acquire_lock(key.as_str(), Duration::from_secs(5))
            .await
            .unwrap();

        let result = coordinator
            .read_through(&key, Duration::from_secs(60), || async {
                Ok::<_, OriginError>(Some("fetched".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(result.value.as_deref(), Some("fetched"));
        // The foreign lock is untouched.
        assert!(
            backend
                .acquire_lock(key.as_str(), Duration::from_secs(5))
                .await
                .is_none()
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "origin fetch panicked");
    }
}
