//! Read-through behavior under concurrency, failure and invalidation.
//!
//! Everything here runs against the in-process backend, so no external
//! services are needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use catalog_cache::{
    CacheBackend, CacheBackendExt, CacheCoordinator, Invalidator, KeySpace, ListParams,
    LocalBackend, LockToken, OriginError, ReadSource, SortOrder,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Barrier, Notify};

const TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Row {
    id: String,
    name: String,
    price: u32,
}

/// Origin stand-in that counts calls and can be held open.
#[derive(Clone, Default)]
struct CountingOrigin {
    calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
    name: Arc<std::sync::Mutex<String>>,
}

impl CountingOrigin {
    fn new(name: &str) -> Self {
        let origin = Self::default();
        origin.set_name(name);
        origin
    }

    fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fetch(
        &self,
        id: &str,
        gated: bool,
    ) -> impl Future<Output = Result<Option<Row>, OriginError>> + Send + use<> {
        let origin = self.clone();
        let id = id.to_string();
        async move {
            origin.calls.fetch_add(1, Ordering::SeqCst);
            if gated {
                origin.gate.notified().await;
            }
            let name = origin.name.lock().unwrap().clone();
            Ok(Some(Row {
                id,
                name,
                price: 10,
            }))
        }
    }
}

/// Backend that never stores anything, as if the cache were switched off.
struct AlwaysMiss;

#[async_trait]
impl CacheBackend for AlwaysMiss {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> bool {
        false
    }
    async fn delete(&self, _key: &str) -> bool {
        true
    }
    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        vec![None; keys.len()]
    }
    async fn multi_set(&self, _entries: &[(String, Vec<u8>)], _ttl: Duration) -> bool {
        false
    }
    async fn delete_by_pattern(&self, _pattern: &str) -> u64 {
        0
    }
    async fn acquire_lock(&self, _key: &str, _ttl: Duration) -> Option<LockToken> {
        None
    }
    async fn release_lock(&self, _key: &str, _token: &LockToken) -> bool {
        true
    }
    async fn clear(&self) -> bool {
        true
    }
    async fn is_healthy(&self) -> bool {
        false
    }
    fn mode(&self) -> &'static str {
        "disabled"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_share_one_origin_call() {
    let coordinator = CacheCoordinator::new(Arc::new(LocalBackend::new()));
    let key = KeySpace::default().item("p1");
    let origin = CountingOrigin::new("Desk");
    let callers = 16;

    // Hold the first fetch open until every caller has issued its read.
    let barrier = Arc::new(Barrier::new(callers + 1));
    let mut handles = Vec::new();
    for _ in 0..callers {
        let coordinator = coordinator.clone();
        let key = key.clone();
        let origin = origin.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            coordinator
                .read_through(&key, TTL, || origin.fetch("p1", true))
                .await
        }));
    }
    barrier.wait().await;
    while coordinator.in_flight().is_empty() {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    origin.gate.notify_one();

    let mut sources = Vec::new();
    for handle in handles {
        let read = handle.await.unwrap().unwrap();
        assert_eq!(read.value.as_ref().map(|r| r.name.as_str()), Some("Desk"));
        sources.push(read.source);
    }

    assert_eq!(origin.calls(), 1);
    assert_eq!(
        sources.iter().filter(|s| **s == ReadSource::Origin).count(),
        1
    );
    assert!(coordinator.in_flight().is_empty());
}

#[tokio::test]
async fn scenario_update_then_refetch() {
    let backend = Arc::new(LocalBackend::new());
    let coordinator = CacheCoordinator::new(backend.clone());
    let keys = KeySpace::default();
    let invalidator = Invalidator::new(backend.clone(), keys.clone());
    let key = keys.item("p1");
    let origin = CountingOrigin::new("Chair");

    // A and B ask at the same time.
    let (a, b) = tokio::join!(
        coordinator.read_through(&key, TTL, || origin.fetch("p1", false)),
        coordinator.read_through(&key, TTL, || origin.fetch("p1", false)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.value, b.value);
    assert_eq!(origin.calls(), 1);

    let cached = coordinator
        .read_through(&key, TTL, || origin.fetch("p1", false))
        .await
        .unwrap();
    assert_eq!(cached.source, ReadSource::Cache);
    assert_eq!(origin.calls(), 1);

    // Committed update, then invalidation.
    origin.set_name("Armchair");
    let report = invalidator.entity_changed("p1").await;
    assert!(report.is_clean());

    let fresh = coordinator
        .read_through(&key, TTL, || origin.fetch("p1", false))
        .await
        .unwrap();
    assert_eq!(fresh.source, ReadSource::Origin);
    assert_eq!(fresh.value.unwrap().name, "Armchair");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn corrupt_cached_payload_is_refetched_and_overwritten() {
    let backend = Arc::new(LocalBackend::new());
    let coordinator = CacheCoordinator::new(backend.clone());
    let key = KeySpace::default().item("p3");
    let origin = CountingOrigin::new("Shelf");

    assert!(backend.set(key.as_str(), b"not json", TTL).await);
    assert_eq!(backend.get_json::<Row>(key.as_str()).await, None);

    let read = coordinator
        .read_through(&key, TTL, || origin.fetch("p3", false))
        .await
        .unwrap();
    assert_eq!(read.source, ReadSource::Origin);
    assert_eq!(read.value.as_ref().map(|r| r.name.as_str()), Some("Shelf"));
    assert_eq!(origin.calls(), 1);

    let stored = backend.get_json::<Row>(key.as_str()).await;
    assert_eq!(stored, read.value);

    // Payload of the wrong shape is a miss as well.
    let other = KeySpace::default().item("p4");
    backend.set_json(other.as_str(), &vec![1, 2, 3], TTL).await;
    let read = coordinator
        .read_through(&other, TTL, || origin.fetch("p4", false))
        .await
        .unwrap();
    assert_eq!(read.source, ReadSource::Origin);
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn failed_fetch_is_not_cached_and_releases_lock() {
    let backend = Arc::new(LocalBackend::new());
    let coordinator = CacheCoordinator::new(backend.clone());
    let key = KeySpace::default().item("p9");
    let attempts = Arc::new(AtomicUsize::new(0));

    let fetch = |attempts: Arc<AtomicUsize>| async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(OriginError::unavailable("database restarting"))
        } else {
            Ok(Some(42u32))
        }
    };

    let err = coordinator
        .read_through(&key, TTL, || fetch(Arc::clone(&attempts)))
        .await
        .unwrap_err();
    assert!(matches!(err, OriginError::Unavailable { .. }));
    assert!(coordinator.in_flight().is_empty());
    assert!(backend.get(key.as_str()).await.is_none());
    // The lock was released on the error path.
    assert!(
        backend
            .acquire_lock(key.as_str(), Duration::from_secs(1))
            .await
            .is_some()
    );
}

#[tokio::test]
async fn failed_fetch_allows_immediate_retry() {
    let coordinator = CacheCoordinator::new(Arc::new(LocalBackend::new()));
    let key = KeySpace::default().item("p10");
    let attempts = Arc::new(AtomicUsize::new(0));

    let fetch = |attempts: Arc<AtomicUsize>| async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(OriginError::query("deadlock detected"))
        } else {
            Ok(Some(42u32))
        }
    };

    assert!(
        coordinator
            .read_through(&key, TTL, || fetch(Arc::clone(&attempts)))
            .await
            .is_err()
    );
    let retried = coordinator
        .read_through(&key, TTL, || fetch(Arc::clone(&attempts)))
        .await
        .unwrap();
    assert_eq!(retried.value, Some(42));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_cache_changes_call_count_not_results() {
    let cached = CacheCoordinator::new(Arc::new(LocalBackend::new()));
    let uncached = CacheCoordinator::new(Arc::new(AlwaysMiss));
    let key = KeySpace::default().item("p3");
    let with_cache = CountingOrigin::new("Shelf");
    let without_cache = CountingOrigin::new("Shelf");

    for _ in 0..3 {
        let a = cached
            .read_through(&key, TTL, || with_cache.fetch("p3", false))
            .await
            .unwrap();
        let b = uncached
            .read_through(&key, TTL, || without_cache.fetch("p3", false))
            .await
            .unwrap();
        assert_eq!(a.value, b.value);
    }

    assert_eq!(with_cache.calls(), 1);
    assert_eq!(without_cache.calls(), 3);
}

#[tokio::test]
async fn two_processes_sharing_a_backend_both_return_the_value() {
    // Two coordinators model two service instances: separate in-flight
    // tables, one shared store.
    let shared = Arc::new(LocalBackend::new());
    let first = CacheCoordinator::new(shared.clone());
    let second = CacheCoordinator::new(shared.clone());
    let key = KeySpace::default().item("p4");
    let origin = CountingOrigin::new("Bench");

    let (a, b) = tokio::join!(
        first.read_through(&key, TTL, || origin.fetch("p4", false)),
        second.read_through(&key, TTL, || origin.fetch("p4", false)),
    );
    assert_eq!(a.unwrap().value, b.unwrap().value);
    // Duplicate fetches across instances are allowed but bounded.
    assert!((1..=2).contains(&origin.calls()));

    let hit = second
        .read_through(&key, TTL, || origin.fetch("p4", false))
        .await
        .unwrap();
    assert_eq!(hit.source, ReadSource::Cache);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_acquisition_is_mutually_exclusive() {
    let backend = Arc::new(LocalBackend::new());
    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            backend
                .acquire_lock("products:v1:item:p5", Duration::from_secs(5))
                .await
        }));
    }

    let mut acquired = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test]
async fn expired_entries_are_misses() {
    let backend = LocalBackend::new();
    backend
        .set_json("products:v1:item:p6", &1u32, Duration::from_millis(50))
        .await;
    assert_eq!(backend.get_json::<u32>("products:v1:item:p6").await, Some(1));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(backend.get_json::<u32>("products:v1:item:p6").await, None);
}

#[tokio::test]
async fn pattern_invalidation_clears_every_list_variant() {
    let backend = Arc::new(LocalBackend::new());
    let keys = KeySpace::default();
    let invalidator = Invalidator::new(backend.clone(), keys.clone());

    let variants = [
        ListParams::new(20, 0, SortOrder::NameAsc, None).unwrap(),
        ListParams::new(10, 10, SortOrder::PriceDesc, None).unwrap(),
        ListParams::new(20, 0, SortOrder::CreatedAtDesc, Some("oak")).unwrap(),
    ];
    for params in &variants {
        backend.set(keys.list(params).as_str(), b"[]", TTL).await;
    }
    backend.set(keys.item("p7").as_str(), b"{}", TTL).await;

    let report = invalidator.collection_changed().await;
    assert_eq!(report.list_entries_dropped, 3);
    for params in &variants {
        assert!(backend.get(keys.list(params).as_str()).await.is_none());
    }
    assert!(backend.get(keys.item("p7").as_str()).await.is_some());
}

#[tokio::test]
async fn version_bump_retires_old_entries() {
    let backend = Arc::new(LocalBackend::new());
    let coordinator = CacheCoordinator::new(backend.clone());
    let origin = CountingOrigin::new("Lamp");

    let v1 = KeySpace::new("products", "v1").item("p8");
    let v2 = KeySpace::new("products", "v2").item("p8");

    coordinator
        .read_through(&v1, TTL, || origin.fetch("p8", false))
        .await
        .unwrap();
    let after_bump = coordinator
        .read_through(&v2, TTL, || origin.fetch("p8", false))
        .await
        .unwrap();
    assert_eq!(after_bump.source, ReadSource::Origin);
    assert_eq!(origin.calls(), 2);
}
