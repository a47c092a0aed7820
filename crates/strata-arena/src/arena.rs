//! Typed façade over [`ThreadSafeArena`].
//!
//! [`Arena`] hands out references that live as long as the arena borrow,
//! registers destructors for values that need them, and can be built over a
//! caller-supplied buffer that outlives it.
//!
//! # Examples
//!
//! ```
//! use strata_arena::Arena;
//!
//! let mut arena = Arena::new();
//! let name = arena.alloc_str("selector");
//! let list = arena.alloc(vec![1, 2, 3]);
//! list.push(4);
//!
//! assert_eq!(name, "selector");
//! assert_eq!(list.len(), 4);
//!
//! // Runs the `Vec` destructor and releases every block.
//! arena.reset();
//! ```

use std::alloc::Layout;
use std::any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::str;

use crate::error::{ArenaError, fatal};
use crate::policy::{AllocationPolicy, BLOCK_ALIGNMENT};
use crate::serial::CleanupSlot;
use crate::thread_cache::{LifecycleId, OwnerId};
use crate::thread_safe::ThreadSafeArena;

unsafe fn drop_value<T>(elem: *mut u8) {
    // SAFETY: registered once for an initialized `T` at `elem`.
    unsafe { ptr::drop_in_place(elem.cast::<T>()) }
}

unsafe fn drop_box<T>(elem: *mut u8) {
    // SAFETY: `elem` came from `Box::into_raw` and is dropped once.
    drop(unsafe { Box::from_raw(elem.cast::<T>()) });
}

/// Bytes to request so that `layout` fits once the 8-aligned result is
/// moved up to `layout.align()`.
fn padded_size(layout: Layout) -> usize {
    if layout.align() <= BLOCK_ALIGNMENT {
        return layout.size();
    }
    let padding = layout.align() - BLOCK_ALIGNMENT;
    layout.size().checked_add(padding).unwrap_or_else(|| {
        fatal(ArenaError::SizeOverflow {
            requested: layout.size(),
            overhead: padding,
        })
    })
}

#[inline]
fn align_to(ptr: NonNull<u8>, align: usize) -> NonNull<u8> {
    if align <= BLOCK_ALIGNMENT {
        return ptr;
    }
    let offset = ptr.as_ptr().align_offset(align);
    // SAFETY: `padded_size` reserved `align - 8` spare bytes, and the
    // offset from an 8-aligned address is at most that.
    unsafe { ptr.add(offset) }
}

/// A region allocator handle shared by reference across threads.
///
/// Values allocated here live until [`Arena::reset`] or drop, both of which
/// need exclusive access, so returned references can never dangle. Values
/// with destructors have them run at that point, possibly on another thread,
/// which is why typed allocation requires `T: Send`.
///
/// `'buf` is the lifetime of the caller buffer passed to
/// [`Arena::with_initial_block`]; arenas without one are `Arena<'static>`.
pub struct Arena<'buf> {
    inner: ThreadSafeArena,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl Arena<'static> {
    /// Creates an arena that draws every block from the system allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::from_inner(ThreadSafeArena::new())
    }

    /// Creates an arena governed by `policy`.
    #[must_use]
    pub fn with_policy(policy: AllocationPolicy) -> Self {
        Self::from_inner(ThreadSafeArena::with_policy(policy))
    }
}

impl<'buf> Arena<'buf> {
    fn from_inner(inner: ThreadSafeArena) -> Self {
        Self {
            inner,
            _buffer: PhantomData,
        }
    }

    /// Creates an arena whose first block is `buf`.
    ///
    /// The buffer is never released by the arena; its size is still counted
    /// in the totals reported on reset and drop. A buffer too small to hold
    /// the arena's bookkeeping is ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_arena::Arena;
    ///
    /// let mut buf = [0u8; 1024];
    /// let arena = Arena::with_initial_block(&mut buf);
    /// assert_eq!(*arena.alloc(5u32), 5);
    /// assert!(arena.space_allocated() <= 1024);
    /// ```
    #[must_use]
    pub fn with_initial_block(buf: &'buf mut [u8]) -> Self {
        Self::over_buffer(buf, None)
    }

    /// Creates an arena over `buf` governed by `policy`.
    ///
    /// The policy is stored in the buffer when it fits; otherwise the buffer
    /// is ignored and the first block comes from the policy's source.
    #[must_use]
    pub fn with_initial_block_and_policy(buf: &'buf mut [u8], policy: AllocationPolicy) -> Self {
        Self::over_buffer(buf, Some(policy))
    }

    fn over_buffer(buf: &'buf mut [u8], policy: Option<AllocationPolicy>) -> Self {
        let offset = buf.as_ptr().align_offset(BLOCK_ALIGNMENT).min(buf.len());
        let block = &mut buf[offset..];
        let size = block.len() & !(BLOCK_ALIGNMENT - 1);

        if size == 0 {
            strata_log::warn!("ignoring initial block with no aligned space");
            return match policy {
                Some(policy) => Self::from_inner(ThreadSafeArena::with_policy(policy)),
                None => Self::from_inner(ThreadSafeArena::new()),
            };
        }

        let ptr = NonNull::from(block).cast::<u8>();
        // SAFETY: `ptr` is 8-aligned with `size` writable bytes, and the
        // exclusive borrow keeps everything else away for `'buf`.
        Self::from_inner(unsafe { ThreadSafeArena::from_raw_block(ptr, size, policy) })
    }

    /// Returns the underlying untyped arena.
    #[must_use]
    pub fn as_thread_safe(&self) -> &ThreadSafeArena {
        &self.inner
    }

    /// Moves `value` into the arena.
    ///
    /// If `T` needs dropping, its destructor runs when the arena is reset or
    /// dropped.
    #[inline]
    #[allow(clippy::mut_from_ref)] // Each call hands out a fresh, disjoint slot
    pub fn alloc<T: Send>(&self, value: T) -> &mut T {
        let layout = Layout::new::<T>();
        let type_name = Some(any::type_name::<T>());
        let size = padded_size(layout);

        let slot = if mem::needs_drop::<T>() {
            let (raw, cleanup) = self.inner.allocate_aligned_with_cleanup(size, type_name);
            let slot = align_to(raw, layout.align()).cast::<T>();
            // SAFETY: the slot is aligned, sized for `T` and unaliased; the
            // destructor is registered only after the value is written.
            unsafe {
                slot.as_ptr().write(value);
                cleanup.set(slot.as_ptr().cast(), drop_value::<T>);
            }
            slot
        } else {
            let raw = self.inner.allocate_aligned(size, type_name);
            let slot = align_to(raw, layout.align()).cast::<T>();
            // SAFETY: as above.
            unsafe { slot.as_ptr().write(value) };
            slot
        };

        // SAFETY: initialized above and lives until `reset` or drop.
        unsafe { &mut *slot.as_ptr() }
    }

    /// Allocates uninitialized memory for `layout`.
    ///
    /// Alignments above 8 are honored by over-allocating.
    #[inline]
    pub fn alloc_layout(&self, layout: Layout) -> NonNull<u8> {
        let raw = self.inner.allocate_aligned(padded_size(layout), None);
        align_to(raw, layout.align())
    }

    /// Copies `src` into the arena.
    #[allow(clippy::mut_from_ref)] // Each call hands out a fresh, disjoint slice
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let layout = Layout::for_value(src);
        let raw = self
            .inner
            .allocate_aligned(padded_size(layout), Some(any::type_name::<[T]>()));
        let dst = align_to(raw, layout.align()).cast::<T>();
        // SAFETY: `dst` is aligned with room for `src.len()` elements, and
        // fresh arena memory cannot overlap `src`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len());
            slice::from_raw_parts_mut(dst.as_ptr(), src.len())
        }
    }

    /// Copies `s` into the arena.
    #[allow(clippy::mut_from_ref)] // Each call hands out a fresh, disjoint string
    pub fn alloc_str(&self, s: &str) -> &mut str {
        let bytes = self.alloc_slice_copy(s.as_bytes());
        // SAFETY: copied from a valid `str`.
        unsafe { str::from_utf8_unchecked_mut(bytes) }
    }

    /// Takes ownership of a heap value; it is dropped with the arena.
    ///
    /// The box itself is not moved into arena memory.
    #[allow(clippy::mut_from_ref)] // The box is uniquely owned by the arena
    pub fn own<T: Send>(&self, boxed: Box<T>) -> &mut T {
        let raw = Box::into_raw(boxed);
        // SAFETY: `raw` is a live box handed to the arena exactly once, and
        // `T: Send` allows dropping it on the resetting thread.
        unsafe {
            self.inner.add_cleanup(raw.cast(), drop_box::<T>);
            &mut *raw
        }
    }

    /// Allocates `n` bytes (rounded up to 8) aligned to 8.
    #[inline]
    pub fn allocate_aligned(&self, n: usize) -> NonNull<u8> {
        self.inner.allocate_aligned(n, None)
    }

    /// Allocates `n` bytes and reserves a cleanup slot next to them.
    #[inline]
    pub fn allocate_aligned_with_cleanup(&self, n: usize) -> (NonNull<u8>, CleanupSlot<'_>) {
        self.inner.allocate_aligned_with_cleanup(n, None)
    }

    /// Registers `cleanup(elem)` to run on reset or drop.
    ///
    /// # Safety
    ///
    /// See [`CleanupSlot::set`].
    pub unsafe fn add_cleanup(&self, elem: *mut u8, cleanup: unsafe fn(*mut u8)) {
        // SAFETY: forwarded from the caller.
        unsafe { self.inner.add_cleanup(elem, cleanup) }
    }

    /// Drops every value in the arena and releases its blocks, keeping a
    /// caller-owned initial block for reuse. Returns the bytes released.
    pub fn reset(&mut self) -> u64 {
        self.inner.reset()
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn space_used(&self) -> u64 {
        self.inner.space_used()
    }

    /// Bytes reserved from the memory source (and the caller buffer).
    #[must_use]
    pub fn space_allocated(&self) -> u64 {
        self.inner.space_allocated()
    }

    /// Tag of the current generation; changes on every reset.
    #[must_use]
    pub fn lifecycle_id(&self) -> LifecycleId {
        self.inner.lifecycle_id()
    }

    /// Threads that have allocated in the current generation.
    #[must_use]
    pub fn owners(&self) -> Vec<OwnerId> {
        self.inner.owners()
    }
}

impl Default for Arena<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Arena").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_alloc_round_trips_values() {
        let arena = Arena::new();
        let a = arena.alloc(1u8);
        let b = arena.alloc(0xDEAD_BEEFu64);
        let c = arena.alloc((3u16, 'x'));
        *a += 1;

        assert_eq!(*a, 2);
        assert_eq!(*b, 0xDEAD_BEEF);
        assert_eq!(*c, (3, 'x'));
    }

    #[test]
    fn test_plain_values_register_no_cleanup() {
        let arena = Arena::new();
        arena.alloc(5u64);
        assert_eq!(arena.space_used(), 8);
    }

    #[test]
    fn test_drop_runs_destructors_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let arena = Arena::new();
            for _ in 0..100 {
                arena.alloc(Counted(drops.clone()));
            }
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_reset_runs_destructors_and_allows_reuse() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arena = Arena::new();
        arena.alloc(Counted(drops.clone()));
        arena.own(Box::new(Counted(drops.clone())));

        arena.reset();
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        arena.alloc(Counted(drops.clone()));
        drop(arena);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[repr(align(64))]
    struct Wide(#[allow(dead_code)] [u8; 64]);

    #[test]
    fn test_over_aligned_values() {
        let arena = Arena::new();
        for _ in 0..10 {
            arena.alloc(1u8);
            let wide = arena.alloc(Wide([7; 64]));
            assert_eq!(wide as *mut Wide as usize % 64, 0);
        }

        let raw = arena.alloc_layout(Layout::from_size_align(10, 32).unwrap());
        assert_eq!(raw.as_ptr() as usize % 32, 0);
    }

    #[test]
    fn test_slices_and_strings_are_copied() {
        let arena = Arena::new();
        let nums = arena.alloc_slice_copy(&[1u32, 2, 3]);
        nums[0] = 10;
        assert_eq!(nums, &[10, 2, 3]);

        let empty: &mut [u64] = arena.alloc_slice_copy(&[]);
        assert!(empty.is_empty());

        let greeting = String::from("hello");
        let copy = arena.alloc_str(&greeting);
        drop(greeting);
        copy.make_ascii_uppercase();
        assert_eq!(copy, "HELLO");
    }

    #[repr(align(8))]
    struct Buffer([u8; 4096]);

    #[test]
    fn test_initial_block_is_used_first() {
        let mut buf = Buffer([0; 4096]);
        let range = buf.0.as_ptr_range();
        let arena = Arena::with_initial_block(&mut buf.0);

        let value = arena.alloc(42u64);
        let addr = value as *mut u64 as *const u8;
        assert!(range.contains(&addr));
        assert_eq!(arena.space_allocated(), 4096);
    }

    #[test]
    fn test_tiny_initial_block_is_ignored() {
        let mut buf = [0u8; 16];
        let arena = Arena::with_initial_block(&mut buf);
        assert_eq!(*arena.alloc(9u32), 9);
        assert_ne!(arena.space_allocated(), 16);
    }

    #[test]
    fn test_unaligned_initial_block_is_trimmed() {
        let mut buf = vec![0u64; 130];
        // SAFETY: reinterpreting initialized integers as bytes.
        let bytes = unsafe {
            slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>().add(3), 1024)
        };
        let arena = Arena::with_initial_block(bytes);
        assert_eq!(arena.space_allocated(), 1016);
        assert_eq!(arena.alloc(1u64) as *mut u64 as usize % 8, 0);
    }

    thread_local! {
        static HITS: Cell<usize> = const { Cell::new(0) };
    }

    unsafe fn bump(_: *mut u8) {
        HITS.with(|hits| hits.set(hits.get() + 1));
    }

    #[test]
    fn test_raw_cleanup_surface() {
        let mut arena = Arena::new();
        let (data, slot) = arena.allocate_aligned_with_cleanup(16);
        unsafe {
            slot.set(data.as_ptr(), bump);
            arena.add_cleanup(ptr::null_mut(), bump);
        }
        assert_eq!(arena.allocate_aligned(3).as_ptr() as usize % 8, 0);

        arena.reset();
        assert_eq!(HITS.with(Cell::get), 2);
    }
}
