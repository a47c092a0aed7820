//! Raw memory blocks and the block growth policy.
//!
//! Every block starts with a [`Block`] header written in place. The rest of
//! the block is shared by two sub-allocators: bump allocations grow upward
//! from just past the header and cleanup nodes grow downward from the end.
//!
//! ```text
//! +--------+---------------------------+ ........ +-------------------+
//! | Block  | data (bump cursor grows ->)|  free    | (<- cleanup nodes)|
//! +--------+---------------------------+ ........ +-------------------+
//! ^ base   ^ base + BLOCK_HEADER_SIZE                    base + size & !7 ^
//! ```

use std::mem;
use std::ptr::{self, NonNull};

use crate::error::{ArenaError, Result, fatal};
use crate::policy::{
    AllocationPolicy, DEFAULT_MAX_BLOCK_SIZE, DEFAULT_START_BLOCK_SIZE, MemorySource, SystemMemory,
};
use crate::serial::CleanupNode;

/// Rounds `n` up to the next multiple of eight.
#[inline]
pub(crate) const fn align_up_to_8(n: usize) -> usize {
    (n + 7) & !7
}

/// Like [`align_up_to_8`], but reports overflow instead of wrapping.
#[inline]
pub(crate) fn checked_align_up_to_8(n: usize) -> Result<usize> {
    match n.checked_add(7) {
        Some(padded) => Ok(padded & !7),
        None => Err(ArenaError::SizeOverflow {
            requested: n,
            overhead: 7,
        }),
    }
}

/// Header at the start of every block.
#[repr(C)]
pub(crate) struct Block {
    /// The previous (older) block of the same serial arena.
    pub(crate) next: *mut Block,
    /// Total size of the block including this header.
    pub(crate) size: usize,
    /// Lowest cleanup node in this block, synced when the block is retired.
    pub(crate) cleanup_start: *mut CleanupNode,
}

/// Bytes reserved at the front of each block for its header.
pub const BLOCK_HEADER_SIZE: usize = align_up_to_8(mem::size_of::<Block>());

impl Block {
    /// Writes a header at the start of `mem` and returns it.
    ///
    /// # Safety
    ///
    /// `mem` must be a live, 8-aligned block of at least
    /// [`BLOCK_HEADER_SIZE`] bytes owned by the caller.
    pub(crate) unsafe fn init(mem: Memory, next: *mut Block) -> *mut Block {
        debug_assert!(mem.size >= BLOCK_HEADER_SIZE);
        let block = mem.ptr.as_ptr().cast::<Block>();
        // SAFETY: caller guarantees the memory is valid and aligned.
        unsafe {
            block.write(Block {
                next,
                size: mem.size,
                cleanup_start: ptr::null_mut(),
            });
        }
        block
    }

    /// Returns the address `offset` bytes past the start of `block`.
    ///
    /// # Safety
    ///
    /// `offset` must not exceed the block size.
    #[inline]
    pub(crate) unsafe fn pointer(block: *mut Block, offset: usize) -> *mut u8 {
        // SAFETY: offset stays within (or one past) the block.
        unsafe { block.cast::<u8>().add(offset) }
    }

    /// End of the usable region, rounded down to eight bytes.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub(crate) unsafe fn limit(block: *mut Block) -> *mut u8 {
        unsafe { Self::pointer(block, (*block).size & !7) }
    }

    /// Describes the whole block as a [`Memory`] region.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub(crate) unsafe fn memory(block: *mut Block) -> Memory {
        Memory {
            // SAFETY: blocks are never null.
            ptr: unsafe { NonNull::new_unchecked(block.cast::<u8>()) },
            size: unsafe { (*block).size },
        }
    }
}

/// A raw region of memory and its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Memory {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) size: usize,
}

/// Computes the size of the next block of a serial arena.
///
/// With no previous block (`last_size == 0`) this is the policy's start
/// size; otherwise the previous size doubles up to the policy's maximum.
/// Either way the result is raised to at least `BLOCK_HEADER_SIZE +
/// min_bytes`, so a single new block can always satisfy the request.
///
/// # Errors
///
/// Returns [`ArenaError::SizeOverflow`] if `min_bytes` plus the header does
/// not fit in `usize`.
///
/// # Examples
///
/// ```
/// use strata_arena::{AllocationPolicy, BLOCK_HEADER_SIZE, next_block_size};
///
/// let policy = AllocationPolicy::default()
///     .with_start_block_size(64)
///     .with_max_block_size(256);
///
/// assert_eq!(next_block_size(Some(&policy), 0, 8), Ok(64));
/// assert_eq!(next_block_size(Some(&policy), 64, 8), Ok(128));
/// assert_eq!(next_block_size(Some(&policy), 256, 8), Ok(256));
/// assert_eq!(next_block_size(Some(&policy), 64, 300), Ok(300 + BLOCK_HEADER_SIZE));
/// ```
pub fn next_block_size(
    policy: Option<&AllocationPolicy>,
    last_size: usize,
    min_bytes: usize,
) -> Result<usize> {
    let (start, max) = policy.map_or((DEFAULT_START_BLOCK_SIZE, DEFAULT_MAX_BLOCK_SIZE), |p| {
        (p.start_block_size, p.max_block_size)
    });

    let size = if last_size != 0 {
        last_size.saturating_mul(2).min(max)
    } else {
        start
    };

    let required =
        min_bytes
            .checked_add(BLOCK_HEADER_SIZE)
            .ok_or(ArenaError::SizeOverflow {
                requested: min_bytes,
                overhead: BLOCK_HEADER_SIZE,
            })?;

    Ok(size.max(required))
}

/// Returns the memory source configured by `policy`, or the system one.
pub(crate) fn source_of(policy: Option<&AllocationPolicy>) -> &dyn MemorySource {
    match policy {
        Some(policy) => policy.source(),
        None => &SystemMemory,
    }
}

/// Draws a new block sized by [`next_block_size`].
///
/// Panics on size overflow; out-of-memory handling belongs to the source.
pub(crate) fn allocate_memory(
    policy: Option<&AllocationPolicy>,
    last_size: usize,
    min_bytes: usize,
) -> Memory {
    let size = next_block_size(policy, last_size, min_bytes).unwrap_or_else(|err| fatal(err));
    let ptr = source_of(policy).allocate(size);
    strata_log::trace!("acquired {size} byte block (previous {last_size}, request {min_bytes})");
    Memory { ptr, size }
}

/// Hands blocks back to their source and counts the bytes released.
pub(crate) struct Deallocator<'a> {
    source: &'a dyn MemorySource,
    released: usize,
}

impl<'a> Deallocator<'a> {
    pub(crate) fn new(source: &'a dyn MemorySource) -> Self {
        Self {
            source,
            released: 0,
        }
    }

    /// Releases `mem`.
    ///
    /// # Safety
    ///
    /// `mem` must have come from this deallocator's source and must not be
    /// touched afterwards.
    pub(crate) unsafe fn release(&mut self, mem: Memory) {
        // SAFETY: forwarded from the caller.
        unsafe { self.source.release(mem.ptr, mem.size) };
        self.released += mem.size;
    }

    /// Counts `size` bytes as released without touching any memory.
    pub(crate) fn account(&mut self, size: usize) {
        self.released += size;
    }

    pub(crate) fn released(&self) -> usize {
        self.released
    }
}
