//! Post-mutation invalidation.
//!
//! Call these only after the origin has committed the write. Nothing here
//! returns an error: a failed delete is logged and counted in the report,
//! and the entry's TTL bounds how long it can stay stale.

use std::sync::Arc;

use crate::backend::CacheBackend;
use crate::keys::{CacheKey, KeySpace};

/// What one invalidation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Exact keys whose delete succeeded.
    pub keys_deleted: usize,
    /// List entries removed by the pattern delete.
    pub list_entries_dropped: u64,
    /// Exact deletes that failed.
    pub failures: usize,
}

impl InvalidationReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// Deletes the cache entries derived from one entity type.
#[derive(Clone)]
pub struct Invalidator {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
}

impl Invalidator {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// The entity was updated or deleted: drop its item and tags entries and
    /// every list view.
    pub async fn entity_changed(&self, id: &str) -> InvalidationReport {
        let mut report = self
            .delete_keys(&[self.keys.item(id), self.keys.tags(id)])
            .await;
        report.list_entries_dropped = self.drop_lists().await;
        tracing::debug!(id = %id, ?report, "entity invalidated");
        report
    }

    /// An entity was created: only list views can be stale.
    pub async fn collection_changed(&self) -> InvalidationReport {
        let report = InvalidationReport {
            list_entries_dropped: self.drop_lists().await,
            ..InvalidationReport::default()
        };
        tracing::debug!(?report, "collection invalidated");
        report
    }

    /// Data derived from the entity changed (its tags): drop the item and
    /// tags entries, lists are unaffected.
    pub async fn derived_changed(&self, id: &str) -> InvalidationReport {
        let report = self
            .delete_keys(&[self.keys.item(id), self.keys.tags(id)])
            .await;
        tracing::debug!(id = %id, ?report, "derived data invalidated");
        report
    }

    async fn delete_keys(&self, keys: &[CacheKey]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        for key in keys {
            if self.backend.delete(key.as_str()).await {
                report.keys_deleted += 1;
            } else {
                report.failures += 1;
                tracing::warn!(key = %key, "cache invalidation failed, entry expires by TTL");
            }
        }
        crate::metrics::record_invalidation("exact", report.keys_deleted as u64);
        report
    }

    async fn drop_lists(&self) -> u64 {
        let pattern = self.keys.list_pattern();
        let removed = self.backend.delete_by_pattern(&pattern).await;
        crate::metrics::record_invalidation("pattern", removed);
        removed
    }
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("backend", &self.backend.mode())
            .field("keys", &self.keys)
            .finish()
    }
}
