//! Process-local table of pending origin fetches.
//!
//! Each entry is a shared handle that every concurrent caller for the same
//! key awaits. At most one entry exists per key; it is removed when the
//! fetch settles, on every exit path, through [`InFlightGuard`].

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, Shared};

use crate::error::OriginError;

/// Type-erased fetch result shared between waiters.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// A settled fetch's value.
#[derive(Clone)]
pub struct Fetched {
    pub value: SharedValue,
    /// Read back from another process's write-back, not from the origin.
    pub from_peer: bool,
}

/// What every waiter on an in-flight fetch observes.
pub type FetchOutcome = Result<Option<Fetched>, OriginError>;

/// Cloneable handle on a pending fetch.
pub type InFlightFuture = Shared<BoxFuture<'static, FetchOutcome>>;

struct Pending {
    generation: u64,
    future: InFlightFuture,
}

/// Result of [`InFlightTable::join_or_start`].
pub(crate) enum Slot {
    /// No fetch was pending; the caller started one.
    Leader(InFlightFuture),
    /// A fetch was already pending; the caller joined it.
    Joined(InFlightFuture),
}

/// Map from cache key to the fetch currently running for it.
///
/// Owned by a [`CacheCoordinator`](crate::CacheCoordinator) and shared with
/// the fetch tasks it spawns. Separate coordinators never share a table.
#[derive(Default)]
pub struct InFlightTable {
    pending: DashMap<String, Pending>,
    next_generation: AtomicU64,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fetches currently pending.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a fetch for `key` is pending.
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Join the fetch pending for `key`, or start one with `start`.
    ///
    /// The check and the registration happen under one map entry, so two
    /// callers can never both become the leader for a key. `start` receives
    /// the generation to hand to the [`InFlightGuard`] of the new fetch.
    pub(crate) fn join_or_start<S>(&self, key: &str, start: S) -> Slot
    where
        S: FnOnce(u64) -> InFlightFuture,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(pending) => Slot::Joined(pending.get().future.clone()),
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let future = start(generation);
                slot.insert(Pending {
                    generation,
                    future: future.clone(),
                });
                Slot::Leader(future)
            }
        }
    }

    fn complete(&self, key: &str, generation: u64) {
        self.pending
            .remove_if(key, |_, pending| pending.generation == generation);
    }
}

impl std::fmt::Debug for InFlightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Removes one fetch's entry from the table when dropped.
pub(crate) struct InFlightGuard {
    table: Arc<InFlightTable>,
    key: String,
    generation: u64,
}

impl InFlightGuard {
    pub(crate) fn new(table: Arc<InFlightTable>, key: String, generation: u64) -> Self {
        Self {
            table,
            key,
            generation,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.complete(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn ready(value: u32) -> InFlightFuture {
        async move {
            Ok::<_, OriginError>(Some(Fetched {
                value: Arc::new(value) as SharedValue,
                from_peer: false,
            }))
        }
            .boxed()
            .shared()
    }

    #[tokio::test]
    async fn second_caller_joins_the_first() {
        let table = InFlightTable::new();

        let first = table.join_or_start("k", |_| ready(1));
        assert!(matches!(first, Slot::Leader(_)));

        let second = table.join_or_start("k", |_| ready(2));
        let Slot::Joined(joined) = second else {
            panic!("expected to join the pending fetch");
        };
        let fetched = joined.await.unwrap().unwrap();
        assert_eq!(*fetched.value.downcast::<u32>().unwrap(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn guard_removes_only_its_own_generation() {
        let table = Arc::new(InFlightTable::new());
        let mut generation = None;
        let _ = table.join_or_start("k", |g| {
            generation = Some(g);
            ready(1)
        });
        let generation = generation.unwrap();

        drop(InFlightGuard::new(Arc::clone(&table), "k".into(), generation + 1));
        assert!(table.contains("k"));

        drop(InFlightGuard::new(Arc::clone(&table), "k".into(), generation));
        assert!(table.is_empty());
    }
}
