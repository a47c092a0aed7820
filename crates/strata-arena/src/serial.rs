//! Single-writer bump allocator over a growing chain of blocks.
//!
//! A `SerialArena` is the slice of an arena owned by one thread. It lives
//! inside its own first block, right after the block header, and carves
//! allocations from the head block with a bump cursor. Deferred cleanups are
//! stored in the same block, growing down from the end, so both
//! sub-allocators check against each other before every reservation:
//!
//! ```text
//! block:  [header][SerialArena][data ->   ptr ....... limit   <- cleanups]
//! ```
//!
//! Only the owning thread moves `ptr`, `limit` or `head`. Other threads read
//! the registry link and the byte counters, so those (and the cursor, which
//! feeds `space_used`) are relaxed atomics written with plain stores.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::block::{BLOCK_HEADER_SIZE, Block, Deallocator, Memory, align_up_to_8, allocate_memory};
use crate::error::{ArenaError, fatal};
use crate::policy::AllocationPolicy;
use crate::thread_cache::OwnerId;

/// A deferred destructor call.
#[repr(C)]
pub(crate) struct CleanupNode {
    elem: *mut u8,
    cleanup: unsafe fn(*mut u8),
}

/// Bytes reserved per cleanup node.
pub(crate) const CLEANUP_SIZE: usize = align_up_to_8(mem::size_of::<CleanupNode>());

// Cleanup walks step by `size_of::<CleanupNode>()`.
const _: () = assert!(CLEANUP_SIZE == mem::size_of::<CleanupNode>());

unsafe fn noop_cleanup(_: *mut u8) {}

/// A reserved cleanup slot, returned next to the data it usually destroys.
///
/// Until [`CleanupSlot::set`] is called the slot holds a no-op, so dropping
/// an unused slot is harmless.
#[must_use = "an unset cleanup slot never runs anything"]
pub struct CleanupSlot<'a> {
    node: NonNull<CleanupNode>,
    _arena: PhantomData<&'a ()>,
}

impl CleanupSlot<'_> {
    pub(crate) fn new(node: NonNull<CleanupNode>) -> Self {
        Self {
            node,
            _arena: PhantomData,
        }
    }

    /// Registers `cleanup(elem)` to run when the arena is reset or dropped.
    ///
    /// # Safety
    ///
    /// `cleanup(elem)` must be sound to call exactly once, from whichever
    /// thread resets or drops the arena, at any point before the arena's
    /// memory is released. It must not depend on other cleanups having run
    /// or not run.
    pub unsafe fn set(self, elem: *mut u8, cleanup: unsafe fn(*mut u8)) {
        // SAFETY: the node was reserved and initialized by the serial arena
        // and stays valid until the arena is reset.
        unsafe { self.node.as_ptr().write(CleanupNode { elem, cleanup }) }
    }
}

/// The part of an arena owned by a single thread.
pub(crate) struct SerialArena {
    owner: OwnerId,
    /// Registry link; written only before the arena is published.
    next: Cell<*mut SerialArena>,
    head: AtomicPtr<Block>,
    /// Bump cursor inside `head`.
    ptr: AtomicPtr<u8>,
    /// Lowest cleanup node inside `head`; the cursor never passes it.
    limit: Cell<*mut u8>,
    /// Bytes bump-allocated in retired blocks.
    space_used: AtomicUsize,
    /// Sum of the sizes of every block in the chain.
    space_allocated: AtomicUsize,
}

/// Bytes a serial arena occupies at the front of its first block.
pub(crate) const SERIAL_ARENA_SIZE: usize = align_up_to_8(mem::size_of::<SerialArena>());

impl SerialArena {
    /// Creates a serial arena inside `mem`, which becomes its first block.
    ///
    /// # Safety
    ///
    /// `mem` must be a live, 8-aligned region of at least
    /// `BLOCK_HEADER_SIZE + SERIAL_ARENA_SIZE` bytes. Ownership of the region
    /// passes to the serial arena until [`SerialArena::free`].
    pub(crate) unsafe fn new(mem: Memory, owner: OwnerId) -> NonNull<SerialArena> {
        debug_assert!(mem.size >= BLOCK_HEADER_SIZE + SERIAL_ARENA_SIZE);
        debug_assert_eq!(mem.ptr.as_ptr() as usize % 8, 0);

        // SAFETY: guaranteed by the caller; every offset stays in the block.
        unsafe {
            let block = Block::init(mem, ptr::null_mut());
            let serial = Block::pointer(block, BLOCK_HEADER_SIZE).cast::<SerialArena>();
            serial.write(SerialArena {
                owner,
                next: Cell::new(ptr::null_mut()),
                head: AtomicPtr::new(block),
                ptr: AtomicPtr::new(Block::pointer(block, BLOCK_HEADER_SIZE + SERIAL_ARENA_SIZE)),
                limit: Cell::new(Block::limit(block)),
                space_used: AtomicUsize::new(0),
                space_allocated: AtomicUsize::new(mem.size),
            });
            NonNull::new_unchecked(serial)
        }
    }

    #[inline]
    pub(crate) fn owner(&self) -> OwnerId {
        self.owner
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut SerialArena {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: *mut SerialArena) {
        self.next.set(next);
    }

    /// Bytes left between the cursor and the lowest cleanup node.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.limit.get() as usize - self.ptr.load(Ordering::Relaxed) as usize
    }

    /// Bump-allocates `n` bytes, growing the chain if the head block is full.
    ///
    /// # Safety
    ///
    /// Must be called from the owning thread. `n` must be a multiple of 8.
    #[inline]
    pub(crate) unsafe fn allocate_aligned(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> NonNull<u8> {
        // SAFETY: forwarded from the caller.
        unsafe {
            match self.maybe_allocate_aligned(n) {
                Some(ptr) => ptr,
                None => self.allocate_aligned_fallback(n, policy),
            }
        }
    }

    #[cold]
    #[inline(never)]
    unsafe fn allocate_aligned_fallback(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> NonNull<u8> {
        // SAFETY: forwarded from the caller; the new block is sized to fit.
        unsafe {
            self.allocate_new_block(n, policy);
            self.allocate_aligned(n, policy)
        }
    }

    /// Bump-allocates `n` bytes from the head block only.
    ///
    /// # Safety
    ///
    /// Must be called from the owning thread. `n` must be a multiple of 8.
    #[inline]
    pub(crate) unsafe fn maybe_allocate_aligned(&self, n: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(n % 8, 0);
        if n > self.remaining() {
            return None;
        }
        let ptr = self.ptr.load(Ordering::Relaxed);
        // SAFETY: `ptr + n` is at most `limit`, inside the head block.
        unsafe {
            self.ptr.store(ptr.add(n), Ordering::Relaxed);
            Some(NonNull::new_unchecked(ptr))
        }
    }

    /// Allocates `n` bytes and reserves a cleanup node in the same block.
    ///
    /// # Safety
    ///
    /// Must be called from the owning thread. `n` must be a multiple of 8.
    #[inline]
    pub(crate) unsafe fn allocate_aligned_with_cleanup(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> (NonNull<u8>, NonNull<CleanupNode>) {
        debug_assert_eq!(n % 8, 0);
        let remaining = self.remaining();
        if remaining < CLEANUP_SIZE || n > remaining - CLEANUP_SIZE {
            // SAFETY: forwarded from the caller.
            return unsafe { self.allocate_aligned_with_cleanup_fallback(n, policy) };
        }

        let ptr = self.ptr.load(Ordering::Relaxed);
        // SAFETY: both reservations fit between cursor and limit (checked).
        unsafe {
            self.ptr.store(ptr.add(n), Ordering::Relaxed);
            (NonNull::new_unchecked(ptr), self.reserve_cleanup_node())
        }
    }

    #[cold]
    #[inline(never)]
    unsafe fn allocate_aligned_with_cleanup_fallback(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> (NonNull<u8>, NonNull<CleanupNode>) {
        let needed = n.checked_add(CLEANUP_SIZE).unwrap_or_else(|| {
            fatal(ArenaError::SizeOverflow {
                requested: n,
                overhead: CLEANUP_SIZE,
            })
        });
        // SAFETY: forwarded from the caller; the new block fits both.
        unsafe {
            self.allocate_new_block(needed, policy);
            self.allocate_aligned_with_cleanup(n, policy)
        }
    }

    /// Registers `cleanup(elem)` without a paired data allocation.
    ///
    /// # Safety
    ///
    /// Must be called from the owning thread; see [`CleanupSlot::set`] for
    /// the contract on `cleanup`.
    pub(crate) unsafe fn add_cleanup(
        &self,
        elem: *mut u8,
        cleanup: unsafe fn(*mut u8),
        policy: Option<&AllocationPolicy>,
    ) {
        // SAFETY: forwarded from the caller.
        unsafe {
            if self.remaining() < CLEANUP_SIZE {
                self.allocate_new_block(CLEANUP_SIZE, policy);
            }
            self.reserve_cleanup_node()
                .as_ptr()
                .write(CleanupNode { elem, cleanup });
        }
    }

    /// Moves `limit` down by one node and fills the node with a no-op.
    ///
    /// # Safety
    ///
    /// Owning thread only, with at least `CLEANUP_SIZE` bytes remaining.
    #[inline]
    unsafe fn reserve_cleanup_node(&self) -> NonNull<CleanupNode> {
        debug_assert!(self.remaining() >= CLEANUP_SIZE);
        // SAFETY: the node lies between cursor and limit.
        unsafe {
            let node = self.limit.get().sub(CLEANUP_SIZE).cast::<CleanupNode>();
            node.write(CleanupNode {
                elem: ptr::null_mut(),
                cleanup: noop_cleanup,
            });
            self.limit.set(node.cast());
            NonNull::new_unchecked(node)
        }
    }

    /// Retires the head block and starts a new one that fits `n` bytes.
    unsafe fn allocate_new_block(&self, n: usize, policy: Option<&AllocationPolicy>) {
        let head = self.head.load(Ordering::Relaxed);
        let ptr = self.ptr.load(Ordering::Relaxed);

        // SAFETY: owner-only access to the live head block.
        unsafe {
            // Draw first: an oversized request panics with the state intact.
            let mem = allocate_memory(policy, (*head).size, n);

            (*head).cleanup_start = self.limit.get().cast();

            let used_in_head = ptr as usize - Block::pointer(head, BLOCK_HEADER_SIZE) as usize;
            self.space_used.store(
                self.space_used.load(Ordering::Relaxed) + used_in_head,
                Ordering::Relaxed,
            );

            self.space_allocated.store(
                self.space_allocated.load(Ordering::Relaxed) + mem.size,
                Ordering::Relaxed,
            );

            let block = Block::init(mem, head);
            self.head.store(block, Ordering::Relaxed);
            self.ptr
                .store(Block::pointer(block, BLOCK_HEADER_SIZE), Ordering::Relaxed);
            self.limit.set(Block::limit(block));
        }
    }

    /// Runs every registered cleanup, in every block, once.
    ///
    /// # Safety
    ///
    /// No other thread may use this serial arena concurrently, and the
    /// arena must be freed or reinitialized afterwards so the cleanups are
    /// not run again.
    pub(crate) unsafe fn cleanup_list(&self) {
        let mut block = self.head.load(Ordering::Relaxed);
        // SAFETY: the chain is owned by this arena and quiescent.
        unsafe {
            (*block).cleanup_start = self.limit.get().cast();
            while !block.is_null() {
                let end = Block::limit(block).cast::<CleanupNode>();
                let mut node = (*block).cleanup_start;
                while node < end {
                    let CleanupNode { elem, cleanup } = node.read();
                    cleanup(elem);
                    node = node.add(1);
                }
                block = (*block).next;
            }
        }
    }

    /// Releases every block except the oldest one, which is returned.
    ///
    /// The returned block still contains this serial arena, so `self` must
    /// not be used after the call.
    ///
    /// # Safety
    ///
    /// No other thread may use this serial arena concurrently; `dealloc` must
    /// release to the source the blocks were drawn from.
    pub(crate) unsafe fn free(&self, dealloc: &mut Deallocator<'_>) -> Memory {
        let mut block = self.head.load(Ordering::Relaxed);
        // SAFETY: the chain is owned by this arena and quiescent; each block
        // is read before the previous one is released.
        unsafe {
            let mut mem = Block::memory(block);
            while !(*block).next.is_null() {
                block = (*block).next;
                dealloc.release(mem);
                mem = Block::memory(block);
            }
            mem
        }
    }

    /// Bytes bump-allocated so far, excluding the serial arena itself.
    ///
    /// Exact when the owner is not allocating; otherwise a snapshot.
    pub(crate) fn space_used(&self) -> u64 {
        let head = self.head.load(Ordering::Relaxed);
        let data_start = head as usize + BLOCK_HEADER_SIZE;
        let in_head = (self.ptr.load(Ordering::Relaxed) as usize).saturating_sub(data_start);
        let total = in_head + self.space_used.load(Ordering::Relaxed);
        total.saturating_sub(SERIAL_ARENA_SIZE) as u64
    }

    /// Bytes reserved across every block of this serial arena.
    pub(crate) fn space_allocated(&self) -> u64 {
        self.space_allocated.load(Ordering::Relaxed) as u64
    }

    #[cfg(test)]
    pub(crate) fn block_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut block = self.head.load(Ordering::Relaxed);
        while !block.is_null() {
            // SAFETY: test-only walk over a live chain.
            unsafe {
                sizes.push((*block).size);
                block = (*block).next;
            }
        }
        sizes.reverse();
        sizes
    }
}
