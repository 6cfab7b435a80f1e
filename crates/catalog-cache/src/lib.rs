//! Read-through cache coordination for hot read paths.
//!
//! The crate sits between a service and its origin data source:
//!
//! - [`CacheBackend`]: fail-open key/value contract with TTLs, pattern
//!   deletes and expiring locks ([`LocalBackend`], [`RedisBackend`])
//! - [`KeySpace`]: deterministic, versioned key derivation
//! - [`CacheCoordinator`]: lookup, in-process coalescing, distributed lock,
//!   origin fetch and write-back
//! - [`Invalidator`]: targeted and pattern deletes after a committed write
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use catalog_cache::{CacheCoordinator, KeySpace, LocalBackend, OriginError};
//!
//! # async fn run() -> Result<(), OriginError> {
//! let coordinator = CacheCoordinator::new(Arc::new(LocalBackend::new()));
//! let keys = KeySpace::default();
//!
//! let read = coordinator
//!     .read_through(&keys.item("p1"), Duration::from_secs(600), || async {
//!         Ok::<_, OriginError>(Some("row from the database".to_string()))
//!     })
//!     .await?;
//! assert!(read.value.is_some());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod inflight;
pub mod invalidation;
pub mod keys;
pub mod local;
pub mod metrics;
pub mod redis_backend;

pub use backend::{
    CacheBackend, CacheBackendExt, HEALTH_CHECK_PREFIX, LockToken, health_check_key,
};
pub use coordinator::{CacheCoordinator, CoordinatorOptions, ReadSource, ReadThrough};
pub use error::{CacheError, OriginError};
pub use inflight::InFlightTable;
pub use invalidation::{InvalidationReport, Invalidator};
pub use keys::{CacheKey, KeySpace, ListParams, ListParamsError, SortOrder};
pub use local::{LocalBackend, LocalStats};
pub use redis_backend::{RedisBackend, RedisPoolOptions};
