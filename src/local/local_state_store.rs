use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;

use crate::clock::Clock;

/// One slot of a [`LocalStateStore`].
///
/// The slot is installed in the map before its value exists. The value is built
/// at most once through the cell, so a caller that loses the insertion race waits
/// for the winner's value instead of building its own.
#[derive(Debug)]
pub(crate) struct StoreEntry<T> {
    value: OnceLock<Arc<T>>,
    last_access_ms: AtomicU64,
}

impl<T> StoreEntry<T> {
    fn new(now_ms: u64) -> Self {
        Self {
            value: OnceLock::new(),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Acquire)
    }
}

/// Concurrent keyed store with exactly-once initialization and idle eviction.
///
/// # Guarantees
///
/// - **Exactly-once:** concurrent first calls for a key run the factory once; all
///   callers receive the same `Arc<T>`.
/// - **No global lock:** lookups go through [`DashMap`]'s sharded locks, which are
///   never held while the factory runs or while the caller uses the value.
/// - **Idle eviction:** [`evict_idle`](Self::evict_idle) drops entries not accessed
///   within the TTL. A caller still holding an evicted `Arc<T>` finishes its work on
///   the detached value; the next access starts over with a fresh one.
#[derive(Debug)]
pub struct LocalStateStore<T> {
    entries: DashMap<String, Arc<StoreEntry<T>>>,
    idle_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> LocalStateStore<T> {
    /// Create an empty store evicting entries idle for longer than `idle_ttl`.
    pub fn new(idle_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl,
            clock,
        }
    } // end constructor

    /// Return the value for `key`, creating it with `factory` on first access.
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let now_ms = self.clock.now_millis();

        // Fast path takes only a shard read lock.
        let entry = match self.entries.get(key) {
            Some(entry) => entry.value().clone(),
            None => self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(StoreEntry::new(now_ms)))
                .value()
                .clone(),
        };

        entry.touch(now_ms);

        entry.value.get_or_init(|| Arc::new(factory())).clone()
    } // end method get_or_create

    /// Remove every entry whose last access is older than the idle TTL at `now_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn evict_idle(&self, now_ms: u64) -> usize {
        let idle_ttl_ms = u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let keep = now_ms.saturating_sub(entry.last_access_ms()) <= idle_ttl_ms;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Evicted idle entries");
        }

        removed
    } // end method evict_idle

    /// Idle TTL this store evicts with.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Unix milliseconds of the most recent [`get_or_create`](Self::get_or_create)
    /// for `key`, if it has an entry.
    pub fn last_access_ms(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.last_access_ms())
    }

    /// Whether `key` currently has an entry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
} // end of impl
