//! The shared arena: a lock-free registry of per-thread serial arenas.
//!
//! Each thread that allocates from a [`ThreadSafeArena`] gets its own
//! [`SerialArena`], created on first use and prepended to an append-only
//! list with a compare-and-swap loop. Nodes are never unlinked while the
//! arena generation is live, so readers can walk the list without any
//! reclamation scheme; the list is torn down only by `reset` and `drop`,
//! both of which take `&mut self`.
//!
//! # Allocation protocol
//!
//! 1. Fast path: the calling thread's cache holds the serial arena it used
//!    last, tagged with the arena generation. A matching tag means the
//!    allocation is a plain bump with no shared-memory access.
//! 2. Hint: the arena remembers the serial arena it handed out last; if it
//!    belongs to the caller it is used directly.
//! 3. Slow path: scan the registry for the caller's serial arena, creating
//!    and publishing one if absent, then refresh the thread cache.
//!
//! When the policy records allocations the fast path is skipped, so every
//! allocation reaches the slow path and is reported to the collector.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::block::{
    BLOCK_HEADER_SIZE, Deallocator, Memory, align_up_to_8, allocate_memory,
    checked_align_up_to_8, source_of,
};
use crate::error::{ArenaError, fatal};
use crate::policy::AllocationPolicy;
use crate::serial::{CleanupSlot, SERIAL_ARENA_SIZE, SerialArena};
use crate::thread_cache::{LifecycleId, OwnerId, ThreadCache, with_thread_cache};

/// Bytes an embedded policy occupies in the first block.
const POLICY_SIZE: usize = align_up_to_8(mem::size_of::<AllocationPolicy>());

/// Smallest caller-owned block that can host the first serial arena.
pub const MIN_INITIAL_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + SERIAL_ARENA_SIZE;

/// Smallest caller-owned block that can also host an embedded policy.
pub const MIN_INITIAL_BLOCK_SIZE_WITH_POLICY: usize = MIN_INITIAL_BLOCK_SIZE + POLICY_SIZE;

/// A region allocator that many threads can allocate from concurrently.
///
/// Most code should use the [`Arena`](crate::Arena) façade, which adds
/// typed allocation on top of this type.
pub struct ThreadSafeArena {
    lifecycle_id: LifecycleId,
    record_allocs: bool,
    /// The first block was supplied by the caller and is never released.
    user_owned_initial_block: bool,
    /// Policy stored inside the first block, or null.
    policy: *mut AllocationPolicy,
    /// Newest-first list of serial arenas.
    threads: AtomicPtr<SerialArena>,
    /// Serial arena handed out most recently.
    hint: AtomicPtr<SerialArena>,
}

// SAFETY: serial arenas are only mutated by their owning thread, shared
// fields are atomics, and teardown requires `&mut self`.
unsafe impl Send for ThreadSafeArena {}
unsafe impl Sync for ThreadSafeArena {}

impl ThreadSafeArena {
    const fn uninit() -> Self {
        Self {
            lifecycle_id: LifecycleId::NONE,
            record_allocs: false,
            user_owned_initial_block: false,
            policy: ptr::null_mut(),
            threads: AtomicPtr::new(ptr::null_mut()),
            hint: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Creates an empty arena. No memory is reserved until the first
    /// allocation.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Self::uninit();
        arena.init(false);
        strata_log::debug!("arena {} created", arena.lifecycle_id);
        arena
    }

    /// Creates an arena governed by `policy`.
    ///
    /// The policy is stored inside a first block drawn from the policy's own
    /// memory source.
    #[must_use]
    pub fn with_policy(policy: AllocationPolicy) -> Self {
        let mut arena = Self::uninit();
        // SAFETY: no caller block is involved.
        unsafe { arena.initialize_with_policy(None, policy) };
        strata_log::debug!("arena {} created with policy", arena.lifecycle_id);
        arena
    }

    /// Creates an arena whose first block is the caller's memory.
    ///
    /// The block is used only if it holds at least
    /// [`MIN_INITIAL_BLOCK_SIZE`] bytes (or
    /// [`MIN_INITIAL_BLOCK_SIZE_WITH_POLICY`] with a policy); otherwise it is
    /// ignored. The arena never releases it, but counts it in the byte totals
    /// reported on reset and destroy.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-aligned and valid for reads and writes of `size`
    /// bytes, and must not be accessed by anything else until the arena is
    /// dropped.
    #[must_use]
    pub unsafe fn from_raw_block(
        ptr: NonNull<u8>,
        size: usize,
        policy: Option<AllocationPolicy>,
    ) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % 8, 0);
        let mem = Some(Memory { ptr, size });
        let mut arena = Self::uninit();
        // SAFETY: forwarded from the caller.
        unsafe {
            match policy {
                Some(policy) => arena.initialize_with_policy(mem, policy),
                None => arena.initialize_from(mem),
            }
        }
        strata_log::debug!(
            "arena {} created over a {size} byte caller block (used: {})",
            arena.lifecycle_id,
            arena.user_owned_initial_block
        );
        arena
    }

    /// Starts a new generation with an empty registry.
    fn init(&mut self, record_allocs: bool) {
        self.lifecycle_id = with_thread_cache(ThreadCache::next_lifecycle_id);
        self.record_allocs = record_allocs;
        self.user_owned_initial_block = false;
        self.policy = ptr::null_mut();
        *self.hint.get_mut() = ptr::null_mut();
        *self.threads.get_mut() = ptr::null_mut();
    }

    /// # Safety
    ///
    /// A caller block in `mem` must satisfy [`Self::from_raw_block`].
    unsafe fn initialize_from(&mut self, mem: Option<Memory>) {
        self.init(false);

        if let Some(mem) = mem {
            if mem.size >= MIN_INITIAL_BLOCK_SIZE {
                self.user_owned_initial_block = true;
                // SAFETY: large enough, and valid per the caller.
                unsafe { self.set_initial_block(mem) };
            } else {
                strata_log::warn!(
                    "ignoring {} byte initial block, need at least {MIN_INITIAL_BLOCK_SIZE}",
                    mem.size
                );
            }
        }
    }

    /// # Safety
    ///
    /// A caller block in `mem` must satisfy [`Self::from_raw_block`].
    unsafe fn initialize_with_policy(&mut self, mem: Option<Memory>, policy: AllocationPolicy) {
        self.init(policy.should_record_allocations());

        let mem = match mem {
            Some(mem) if mem.size >= MIN_INITIAL_BLOCK_SIZE_WITH_POLICY => {
                self.user_owned_initial_block = true;
                mem
            }
            ignored => {
                if let Some(mem) = ignored {
                    strata_log::warn!(
                        "ignoring {} byte initial block, need at least {MIN_INITIAL_BLOCK_SIZE_WITH_POLICY}",
                        mem.size
                    );
                }
                allocate_memory(Some(&policy), 0, SERIAL_ARENA_SIZE + POLICY_SIZE)
            }
        };

        // SAFETY: the block is large enough for a serial arena and the policy.
        unsafe {
            let serial = self.set_initial_block(mem).as_ref();
            let slot = match serial.maybe_allocate_aligned(POLICY_SIZE) {
                Some(slot) => slot.cast::<AllocationPolicy>(),
                None => fatal(ArenaError::PolicyDoesNotFit {
                    required: POLICY_SIZE,
                    available: serial.remaining(),
                }),
            };
            slot.as_ptr().write(policy);
            self.policy = slot.as_ptr();
        }
    }

    /// Installs the first serial arena, owned by the calling thread.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for [`SerialArena::new`].
    unsafe fn set_initial_block(&mut self, mem: Memory) -> NonNull<SerialArena> {
        let serial = with_thread_cache(|tc| {
            // SAFETY: forwarded from the caller.
            let serial = unsafe { SerialArena::new(mem, tc.owner) };
            self.cache_serial_arena(tc, serial);
            serial
        });
        *self.threads.get_mut() = serial.as_ptr();
        serial
    }

    #[inline]
    fn policy(&self) -> Option<&AllocationPolicy> {
        // SAFETY: non-null only while the policy lives in the first block.
        unsafe { self.policy.as_ref() }
    }

    /// Moves the embedded policy out of the first block.
    fn take_policy(&mut self) -> Option<AllocationPolicy> {
        if self.policy.is_null() {
            return None;
        }
        // SAFETY: the policy was written at init and is read exactly once.
        let policy = unsafe { ptr::read(self.policy) };
        self.policy = ptr::null_mut();
        Some(policy)
    }

    /// Returns the tag of the current generation.
    #[must_use]
    pub fn lifecycle_id(&self) -> LifecycleId {
        self.lifecycle_id
    }

    /// Returns `true` if the policy asked for allocation recording.
    #[must_use]
    pub fn records_allocations(&self) -> bool {
        self.record_allocs
    }

    #[inline]
    fn cache_serial_arena(&self, tc: &ThreadCache, serial: NonNull<SerialArena>) {
        tc.store(self.lifecycle_id, serial);
        self.hint.store(serial.as_ptr(), Ordering::Release);
    }

    /// Finds the caller's serial arena without touching the registry.
    #[inline]
    fn serial_arena_fast(&self, tc: &ThreadCache) -> Option<&SerialArena> {
        if let Some(serial) = tc.lookup(self.lifecycle_id) {
            // SAFETY: the cache only matches serial arenas of this generation.
            return Some(unsafe { &*serial.as_ptr() });
        }

        let hint = self.hint.load(Ordering::Acquire);
        // SAFETY: the hint is null or a published serial arena.
        match unsafe { hint.as_ref() } {
            Some(serial) if serial.owner() == tc.owner => Some(serial),
            _ => None,
        }
    }

    /// Finds or creates the caller's serial arena and caches it.
    #[cold]
    #[inline(never)]
    fn serial_arena_fallback(&self, tc: &ThreadCache) -> &SerialArena {
        let me = tc.owner;

        let mut serial = self.threads.load(Ordering::Acquire);
        // SAFETY: registry nodes stay alive for the whole generation.
        while let Some(candidate) = unsafe { serial.as_ref() } {
            if candidate.owner() == me {
                break;
            }
            serial = candidate.next();
        }

        let serial = match NonNull::new(serial) {
            Some(found) => found,
            None => self.register_serial_arena(me),
        };

        self.cache_serial_arena(tc, serial);
        // SAFETY: published above or found in the registry.
        unsafe { &*serial.as_ptr() }
    }

    /// Creates a serial arena for `owner` and publishes it.
    fn register_serial_arena(&self, owner: OwnerId) -> NonNull<SerialArena> {
        let mem = allocate_memory(self.policy(), 0, SERIAL_ARENA_SIZE);
        // SAFETY: sized for a serial arena by `allocate_memory`.
        let serial = unsafe { SerialArena::new(mem, owner) };

        let mut head = self.threads.load(Ordering::Relaxed);
        loop {
            // SAFETY: not yet published; only this thread can see it.
            unsafe { serial.as_ref().set_next(head) };
            match self.threads.compare_exchange_weak(
                head,
                serial.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        strata_log::trace!(
            "arena {} registered serial arena for thread {}",
            self.lifecycle_id,
            owner.get()
        );
        serial
    }

    #[cold]
    fn record_alloc(&self, type_name: Option<&'static str>, n: usize) {
        #[cfg(feature = "alloc-backtrace")]
        if strata_log::log_enabled!(strata_log::Level::Trace) {
            strata_log::trace!(
                "allocation of {n} bytes ({}) at:\n{:?}",
                type_name.unwrap_or("untyped"),
                backtrace::Backtrace::new()
            );
        }

        if let Some(collector) = self.policy().and_then(|p| p.metrics_collector.as_ref()) {
            collector.on_alloc(type_name, n);
        }
    }

    /// Allocates `n` bytes (rounded up to 8) aligned to 8.
    ///
    /// `type_name` is passed to the metrics collector when allocations are
    /// recorded.
    ///
    /// # Panics
    ///
    /// Panics if `n` plus the block overhead overflows `usize`.
    #[inline]
    pub fn allocate_aligned(&self, n: usize, type_name: Option<&'static str>) -> NonNull<u8> {
        let n = checked_align_up_to_8(n).unwrap_or_else(|err| fatal(err));
        with_thread_cache(|tc| {
            if !self.record_allocs {
                if let Some(serial) = self.serial_arena_fast(tc) {
                    // SAFETY: the serial arena belongs to the calling thread.
                    return unsafe { serial.allocate_aligned(n, self.policy()) };
                }
            }
            self.allocate_aligned_fallback(tc, n, type_name)
        })
    }

    #[cold]
    #[inline(never)]
    fn allocate_aligned_fallback(
        &self,
        tc: &ThreadCache,
        n: usize,
        type_name: Option<&'static str>,
    ) -> NonNull<u8> {
        if self.record_allocs {
            self.record_alloc(type_name, n);
        }
        let serial = match self.serial_arena_fast(tc) {
            Some(serial) => serial,
            None => self.serial_arena_fallback(tc),
        };
        // SAFETY: the serial arena belongs to the calling thread.
        unsafe { serial.allocate_aligned(n, self.policy()) }
    }

    /// Allocates `n` bytes and reserves a cleanup slot in the same block.
    ///
    /// # Panics
    ///
    /// Panics if `n` plus the block and cleanup overhead overflows `usize`.
    #[inline]
    pub fn allocate_aligned_with_cleanup(
        &self,
        n: usize,
        type_name: Option<&'static str>,
    ) -> (NonNull<u8>, CleanupSlot<'_>) {
        let n = checked_align_up_to_8(n).unwrap_or_else(|err| fatal(err));
        with_thread_cache(|tc| {
            if !self.record_allocs {
                if let Some(serial) = self.serial_arena_fast(tc) {
                    // SAFETY: the serial arena belongs to the calling thread.
                    let (ptr, node) =
                        unsafe { serial.allocate_aligned_with_cleanup(n, self.policy()) };
                    return (ptr, CleanupSlot::new(node));
                }
            }
            self.allocate_aligned_with_cleanup_fallback(tc, n, type_name)
        })
    }

    #[cold]
    #[inline(never)]
    fn allocate_aligned_with_cleanup_fallback(
        &self,
        tc: &ThreadCache,
        n: usize,
        type_name: Option<&'static str>,
    ) -> (NonNull<u8>, CleanupSlot<'_>) {
        if self.record_allocs {
            self.record_alloc(type_name, n);
        }
        let serial = match self.serial_arena_fast(tc) {
            Some(serial) => serial,
            None => self.serial_arena_fallback(tc),
        };
        // SAFETY: the serial arena belongs to the calling thread.
        let (ptr, node) = unsafe { serial.allocate_aligned_with_cleanup(n, self.policy()) };
        (ptr, CleanupSlot::new(node))
    }

    /// Registers `cleanup(elem)` to run on reset or drop.
    ///
    /// # Safety
    ///
    /// See [`CleanupSlot::set`].
    pub unsafe fn add_cleanup(&self, elem: *mut u8, cleanup: unsafe fn(*mut u8)) {
        with_thread_cache(|tc| {
            let serial = match self.serial_arena_fast(tc) {
                Some(serial) => serial,
                None => self.serial_arena_fallback(tc),
            };
            // SAFETY: owned by the calling thread; contract forwarded.
            unsafe { serial.add_cleanup(elem, cleanup, self.policy()) }
        });
    }

    /// Bytes reserved across every serial arena.
    #[must_use]
    pub fn space_allocated(&self) -> u64 {
        self.serial_arenas().map(SerialArena::space_allocated).sum()
    }

    /// Bytes handed out across every serial arena, excluding bookkeeping and
    /// the embedded policy.
    #[must_use]
    pub fn space_used(&self) -> u64 {
        let used: u64 = self.serial_arenas().map(SerialArena::space_used).sum();
        let policy = if self.policy.is_null() { 0 } else { POLICY_SIZE as u64 };
        used.saturating_sub(policy)
    }

    /// Owner identities of every registered serial arena, newest first.
    #[must_use]
    pub fn owners(&self) -> Vec<OwnerId> {
        self.serial_arenas().map(SerialArena::owner).collect()
    }

    fn serial_arenas(&self) -> impl Iterator<Item = &SerialArena> {
        let mut serial = self.threads.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            // SAFETY: registry nodes stay alive for the whole generation.
            let current = unsafe { serial.as_ref() }?;
            serial = current.next();
            Some(current)
        })
    }

    /// Runs the cleanups of every serial arena.
    fn cleanup_list(&mut self) {
        for serial in self.serial_arenas() {
            // SAFETY: `&mut self` rules out concurrent allocation.
            unsafe { serial.cleanup_list() };
        }
    }

    /// Releases every block except the first block of the oldest serial
    /// arena, which is returned. Leaves the registry empty.
    fn free(&mut self, dealloc: &mut Deallocator<'_>) -> Option<Memory> {
        let mut retained: Option<Memory> = None;
        let mut serial = *self.threads.get_mut();

        // SAFETY: `&mut self` rules out concurrent use. Each serial arena
        // lives in its own oldest block, so its link is read before that
        // block is released on the next iteration.
        unsafe {
            while let Some(current) = serial.as_ref() {
                let next = current.next();
                if let Some(mem) = retained.take() {
                    dealloc.release(mem);
                }
                retained = Some(current.free(dealloc));
                serial = next;
            }
        }

        *self.threads.get_mut() = ptr::null_mut();
        *self.hint.get_mut() = ptr::null_mut();
        retained
    }

    /// Runs every cleanup, releases all blocks except a caller-owned first
    /// block, and starts a new generation with a fresh lifecycle id.
    ///
    /// Returns the number of bytes the arena had reserved, which is also
    /// reported to the policy's metrics collector.
    pub fn reset(&mut self) -> u64 {
        // Destructors may refer to memory in other blocks, so every cleanup
        // runs before anything is released.
        self.cleanup_list();

        let previous = self.lifecycle_id;
        let policy = self.take_policy();

        let (retained, space_allocated) = {
            let mut dealloc = Deallocator::new(source_of(policy.as_ref()));
            let retained = match self.free(&mut dealloc) {
                Some(mem) if self.user_owned_initial_block => {
                    dealloc.account(mem.size);
                    Some(mem)
                }
                Some(mem) => {
                    // SAFETY: drawn from this source and no longer referenced.
                    unsafe { dealloc.release(mem) };
                    None
                }
                None => None,
            };
            (retained, dealloc.released() as u64)
        };

        // SAFETY: a retained block is the caller's block, still valid.
        unsafe {
            match policy {
                Some(policy) => {
                    if let Some(collector) = &policy.metrics_collector {
                        collector.on_reset(space_allocated);
                    }
                    self.initialize_with_policy(retained, policy);
                }
                None => self.initialize_from(retained),
            }
        }

        strata_log::debug!(
            "arena {previous} reset as {} ({space_allocated} bytes)",
            self.lifecycle_id
        );
        space_allocated
    }
}

impl Default for ThreadSafeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadSafeArena {
    fn drop(&mut self) {
        self.cleanup_list();

        let policy = self.take_policy();
        let space_allocated = {
            let mut dealloc = Deallocator::new(source_of(policy.as_ref()));
            match self.free(&mut dealloc) {
                Some(mem) if self.user_owned_initial_block => dealloc.account(mem.size),
                // SAFETY: drawn from this source and no longer referenced.
                Some(mem) => unsafe { dealloc.release(mem) },
                None => {}
            }
            dealloc.released() as u64
        };

        strata_log::debug!(
            "arena {} destroyed ({space_allocated} bytes)",
            self.lifecycle_id
        );

        if let Some(collector) = policy.as_ref().and_then(|p| p.metrics_collector.as_ref()) {
            collector.on_destroy(space_allocated);
        }
    }
}

impl fmt::Debug for ThreadSafeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeArena")
            .field("lifecycle_id", &self.lifecycle_id)
            .field("policy", &self.policy())
            .field("user_owned_initial_block", &self.user_owned_initial_block)
            .field("serial_arenas", &self.serial_arenas().count())
            .field("space_allocated", &self.space_allocated())
            .finish()
    }
}
