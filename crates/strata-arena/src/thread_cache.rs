//! Per-thread identity and the single-entry arena cache.
//!
//! Every thread that touches an arena gets a [`ThreadCache`] through
//! `thread_local!`. It remembers the last arena generation the thread
//! allocated from and the thread's [`SerialArena`] inside it, so repeated
//! allocations from the same arena skip the shared registry entirely. The
//! entry is keyed by [`LifecycleId`], which is never reused, so a cache entry
//! left behind by a reset or dropped arena simply stops matching.

use std::cell::Cell;
use std::fmt;
use std::num::NonZeroU64;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::serial::SerialArena;

/// Number of lifecycle ids a thread reserves from the global counter at once.
const PER_THREAD_IDS: u64 = 256;

/// Source of lifecycle id batches. Batch `k` covers `k * PER_THREAD_IDS ..
/// (k + 1) * PER_THREAD_IDS`; batch zero is never handed out.
static LIFECYCLE_ID_BATCHES: AtomicU64 = AtomicU64::new(1);

/// Source of thread identities.
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tag of one arena generation.
///
/// Every construction and every reset of an arena mints a fresh id. Ids are
/// only ever compared for equality; they never address anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LifecycleId(u64);

impl LifecycleId {
    /// Placeholder for caches that have not seen any arena yet.
    pub(crate) const NONE: LifecycleId = LifecycleId(0);

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LifecycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a thread as seen by the allocator.
///
/// Unlike addresses of thread-local storage, owner ids are never recycled
/// when a thread exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    fn mint() -> Self {
        let raw = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        // The counter starts at one and would take centuries to wrap.
        OwnerId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Returns the identity of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        with_thread_cache(|tc| tc.owner)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Per-thread allocator state.
pub(crate) struct ThreadCache {
    /// Identity stamped on every serial arena this thread creates.
    pub(crate) owner: OwnerId,
    /// Next lifecycle id to hand out from this thread's batch.
    next_lifecycle_id: Cell<u64>,
    /// Arena generation the cached serial arena belongs to.
    last_lifecycle_id_seen: Cell<LifecycleId>,
    last_serial_arena: Cell<*mut SerialArena>,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            owner: OwnerId::mint(),
            next_lifecycle_id: Cell::new(0),
            last_lifecycle_id_seen: Cell::new(LifecycleId::NONE),
            last_serial_arena: Cell::new(ptr::null_mut()),
        }
    }

    /// Mints a lifecycle id, touching the global counter once per batch.
    pub(crate) fn next_lifecycle_id(&self) -> LifecycleId {
        let mut id = self.next_lifecycle_id.get();
        if id % PER_THREAD_IDS == 0 {
            id = LIFECYCLE_ID_BATCHES.fetch_add(1, Ordering::Relaxed) * PER_THREAD_IDS;
        }
        self.next_lifecycle_id.set(id + 1);
        LifecycleId(id)
    }

    /// Returns the cached serial arena if it belongs to generation `id`.
    #[inline]
    pub(crate) fn lookup(&self, id: LifecycleId) -> Option<NonNull<SerialArena>> {
        if self.last_lifecycle_id_seen.get() == id {
            NonNull::new(self.last_serial_arena.get())
        } else {
            None
        }
    }

    /// Replaces the cached entry.
    #[inline]
    pub(crate) fn store(&self, id: LifecycleId, serial: NonNull<SerialArena>) {
        self.last_lifecycle_id_seen.set(id);
        self.last_serial_arena.set(serial.as_ptr());
    }
}

thread_local! {
    static THREAD_CACHE: ThreadCache = ThreadCache::new();
}

/// Runs `f` with the calling thread's cache.
///
/// # Panics
///
/// Panics if called while the thread's locals are being destroyed.
#[inline]
pub(crate) fn with_thread_cache<R>(f: impl FnOnce(&ThreadCache) -> R) -> R {
    THREAD_CACHE.with(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_owner_id_is_stable_per_thread() {
        assert_eq!(OwnerId::current(), OwnerId::current());
    }

    #[test]
    fn test_owner_ids_differ_across_threads() {
        let here = OwnerId::current();
        let there = thread::spawn(OwnerId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_lifecycle_ids_are_unique_within_a_thread() {
        let ids: Vec<LifecycleId> = with_thread_cache(|tc| {
            (0..3 * PER_THREAD_IDS).map(|_| tc.next_lifecycle_id()).collect()
        });

        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(ids.iter().all(|id| *id != LifecycleId::NONE));
    }

    #[test]
    fn test_lifecycle_ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(|| {
                    with_thread_cache(|tc| (0..10).map(|_| tc.next_lifecycle_id()).collect::<Vec<_>>())
                })
            })
            .collect();

        let mut all: Vec<LifecycleId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_cache_lookup_requires_matching_id() {
        let mut dummy = std::mem::MaybeUninit::<SerialArena>::uninit();
        let serial = NonNull::new(dummy.as_mut_ptr()).unwrap();

        with_thread_cache(|tc| {
            let id = tc.next_lifecycle_id();
            let other = tc.next_lifecycle_id();

            tc.store(id, serial);
            assert_eq!(tc.lookup(id), Some(serial));
            assert_eq!(tc.lookup(other), None);
        });
    }
}
