// Shared fixtures for the arena integration tests.
//
// Provides an instrumented memory source, a recording metrics collector and
// a drop counter so tests can observe what the allocator does with memory.

#![allow(dead_code)]

use fxhash::FxHashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strata_arena::{AllocationPolicy, MemorySource, MetricsCollector, SystemMemory};

/// Memory source that forwards to the system allocator and records every
/// block it hands out.
#[derive(Default)]
pub struct CountingMemory {
    live: Mutex<FxHashMap<usize, usize>>,
    sizes: Mutex<Vec<usize>>,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl CountingMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total bytes handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Total bytes handed back.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of blocks not yet released.
    pub fn live_blocks(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Sizes of every block ever handed out, in order.
    pub fn block_sizes(&self) -> Vec<usize> {
        self.sizes.lock().unwrap().clone()
    }
}

unsafe impl MemorySource for CountingMemory {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        let ptr = SystemMemory.allocate(size);
        self.live.lock().unwrap().insert(ptr.as_ptr() as usize, size);
        self.sizes.lock().unwrap().push(size);
        self.allocated.fetch_add(size, Ordering::SeqCst);
        ptr
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let recorded = self.live.lock().unwrap().remove(&(ptr.as_ptr() as usize));
        assert_eq!(
            recorded,
            Some(size),
            "released a block this source never handed out"
        );
        self.released.fetch_add(size, Ordering::SeqCst);
        unsafe { SystemMemory.release(ptr, size) }
    }
}

/// Metrics collector that keeps every event it receives.
#[derive(Default)]
pub struct RecordingCollector {
    pub allocs: Mutex<Vec<(Option<&'static str>, usize)>>,
    pub resets: Mutex<Vec<u64>>,
    pub destroys: Mutex<Vec<u64>>,
}

impl RecordingCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocs(&self) -> Vec<(Option<&'static str>, usize)> {
        self.allocs.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<u64> {
        self.resets.lock().unwrap().clone()
    }

    pub fn destroys(&self) -> Vec<u64> {
        self.destroys.lock().unwrap().clone()
    }
}

impl MetricsCollector for RecordingCollector {
    fn on_alloc(&self, type_name: Option<&'static str>, size: usize) {
        self.allocs.lock().unwrap().push((type_name, size));
    }

    fn on_reset(&self, space_allocated: u64) {
        self.resets.lock().unwrap().push(space_allocated);
    }

    fn on_destroy(&self, space_allocated: u64) {
        self.destroys.lock().unwrap().push(space_allocated);
    }
}

/// Increments a shared counter when dropped.
pub struct DropCounter(pub Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Policy wired to the given instruments.
pub fn instrumented_policy(
    memory: &Arc<CountingMemory>,
    collector: &Arc<RecordingCollector>,
) -> AllocationPolicy {
    AllocationPolicy::default()
        .with_memory_source(memory.clone())
        .with_metrics_collector(collector.clone())
}

/// An 8-aligned stack buffer for caller-owned initial blocks.
#[repr(align(8))]
pub struct AlignedBuffer<const N: usize>(pub [u8; N]);

impl<const N: usize> AlignedBuffer<N> {
    pub fn new() -> Self {
        Self([0; N])
    }

    pub fn address_range(&self) -> std::ops::Range<usize> {
        let start = self.0.as_ptr() as usize;
        start..start + N
    }
}
