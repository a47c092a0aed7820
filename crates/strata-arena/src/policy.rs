//! Allocation policy: block sizing, memory sourcing and telemetry.
//!
//! A policy is fixed for the lifetime of an arena. When an arena is built
//! with a policy, the policy value itself is stored inside the arena's first
//! block, so configuring an arena costs no extra heap allocation.
//!
//! # Examples
//!
//! ```
//! use strata_arena::{AllocationPolicy, Arena};
//!
//! let policy = AllocationPolicy::default()
//!     .with_start_block_size(1024)
//!     .with_max_block_size(64 * 1024);
//!
//! let arena = Arena::with_policy(policy);
//! let value = arena.alloc(7u64);
//! assert_eq!(*value, 7);
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{ArenaError, fatal};

/// Default size of the first block of every serial arena.
pub const DEFAULT_START_BLOCK_SIZE: usize = 256;

/// Default ceiling for the doubling block growth.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8192;

/// Alignment of every block handed out by a [`MemorySource`].
pub const BLOCK_ALIGNMENT: usize = 8;

/// Supplier of the raw blocks an arena carves allocations from.
///
/// # Safety
///
/// `allocate(size)` must return memory that is valid for reads and writes of
/// `size` bytes, aligned to [`BLOCK_ALIGNMENT`], and not aliased by anything
/// else until it is handed back to `release` with the same `size`. If the
/// source cannot satisfy a request it must not return; it applies its own
/// failure policy (panic, abort, `handle_alloc_error`).
pub unsafe trait MemorySource: Send + Sync {
    /// Returns a fresh block of exactly `size` usable bytes.
    fn allocate(&self, size: usize) -> NonNull<u8>;

    /// Returns a block obtained from [`MemorySource::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a single earlier `allocate` call on
    /// this source, and the block must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// The default memory source, backed by the global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl SystemMemory {
    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), BLOCK_ALIGNMENT).unwrap_or_else(|_| {
            fatal(ArenaError::SizeOverflow {
                requested: size,
                overhead: BLOCK_ALIGNMENT,
            })
        })
    }
}

// SAFETY: blocks come straight from the global allocator with an 8-byte
// aligned layout and are released with the same layout.
unsafe impl MemorySource for SystemMemory {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        let layout = Self::layout(size);
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: the caller passes back a pointer from `allocate(size)`,
        // which used this exact layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), Self::layout(size)) }
    }
}

/// Observer of arena lifecycle events.
///
/// Collectors are purely observational; nothing they do changes allocator
/// behavior.
pub trait MetricsCollector: Send + Sync {
    /// Called for every allocation that reaches the slow path while the
    /// policy records allocations. `type_name` is set by the typed helpers.
    fn on_alloc(&self, type_name: Option<&'static str>, size: usize) {
        let _ = (type_name, size);
    }

    /// Called by `reset` with the number of bytes the arena had reserved.
    fn on_reset(&self, space_allocated: u64);

    /// Called on drop with the number of bytes the arena had reserved,
    /// including a caller-owned initial block.
    fn on_destroy(&self, space_allocated: u64);
}

/// Configuration governing block sizing, memory sourcing and telemetry.
#[derive(Clone)]
pub struct AllocationPolicy {
    /// Size of the first block of each serial arena.
    pub start_block_size: usize,
    /// Upper bound for the doubling growth; single large requests may still
    /// produce bigger blocks.
    pub max_block_size: usize,
    /// Where blocks come from. `None` uses [`SystemMemory`].
    pub memory_source: Option<Arc<dyn MemorySource>>,
    /// Receiver of reset, destroy and allocation events.
    pub metrics_collector: Option<Arc<dyn MetricsCollector>>,
    /// Report every slow-path allocation to the metrics collector.
    pub record_allocations: bool,
}

impl AllocationPolicy {
    /// Sets the first block size.
    #[must_use]
    pub fn with_start_block_size(mut self, size: usize) -> Self {
        self.start_block_size = size;
        self
    }

    /// Sets the growth ceiling.
    #[must_use]
    pub fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Draws blocks from `source` instead of the global allocator.
    #[must_use]
    pub fn with_memory_source(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.memory_source = Some(source);
        self
    }

    /// Reports lifecycle events to `collector`.
    #[must_use]
    pub fn with_metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics_collector = Some(collector);
        self
    }

    /// Enables or disables per-allocation reporting.
    #[must_use]
    pub fn with_record_allocations(mut self, record: bool) -> Self {
        self.record_allocations = record;
        self
    }

    /// Returns `true` if allocations should be reported. Recording without a
    /// collector would have nobody to report to, so it is treated as off.
    pub(crate) fn should_record_allocations(&self) -> bool {
        self.record_allocations && self.metrics_collector.is_some()
    }

    pub(crate) fn source(&self) -> &dyn MemorySource {
        match &self.memory_source {
            Some(source) => source.as_ref(),
            None => &SystemMemory,
        }
    }
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            start_block_size: DEFAULT_START_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            memory_source: None,
            metrics_collector: None,
            record_allocations: false,
        }
    }
}

impl fmt::Debug for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationPolicy")
            .field("start_block_size", &self.start_block_size)
            .field("max_block_size", &self.max_block_size)
            .field("custom_memory_source", &self.memory_source.is_some())
            .field("metrics_collector", &self.metrics_collector.is_some())
            .field("record_allocations", &self.record_allocations)
            .finish()
    }
}
