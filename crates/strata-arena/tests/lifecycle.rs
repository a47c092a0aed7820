//! Reset and destroy behavior.
//!
//! Covers deferred cleanup, byte accounting reported to the metrics
//! collector, and the handling of caller-owned initial blocks.

mod common;

use common::{AlignedBuffer, CountingMemory, DropCounter, RecordingCollector, instrumented_policy};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_arena::{
    AllocationPolicy, Arena, MIN_INITIAL_BLOCK_SIZE, MIN_INITIAL_BLOCK_SIZE_WITH_POLICY,
    ThreadSafeArena,
};

thread_local! {
    static CLEANED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

unsafe fn note(elem: *mut u8) {
    CLEANED.with(|cleaned| cleaned.borrow_mut().push(elem as usize));
}

#[test]
fn test_cleanup_runs_exactly_once_on_reset() {
    let mut arena = ThreadSafeArena::new();
    let marker = Box::into_raw(Box::new(0u64));

    unsafe { arena.add_cleanup(marker.cast(), note) };
    for _ in 0..1000 {
        arena.allocate_aligned(64, None);
    }

    arena.reset();
    arena.reset();
    drop(arena);

    let cleaned = CLEANED.with(|cleaned| cleaned.take());
    assert_eq!(cleaned, vec![marker as usize]);
    drop(unsafe { Box::from_raw(marker) });
}

#[test]
fn test_reset_starts_a_new_generation() {
    let mut arena = Arena::new();
    arena.allocate_aligned(32);
    let before = arena.lifecycle_id();
    let used_before = arena.space_used();

    let released = arena.reset();

    assert!(released > 0);
    assert_ne!(arena.lifecycle_id(), before);
    assert_eq!(used_before, 32);
    assert_eq!(arena.space_used(), 0);
    assert_eq!(arena.space_allocated(), 0);

    arena.allocate_aligned(32);
    assert_eq!(arena.space_used(), 32);
}

#[test]
fn test_reset_reports_released_bytes() {
    let memory = CountingMemory::new();
    let collector = RecordingCollector::new();
    let mut arena = Arena::with_policy(instrumented_policy(&memory, &collector));

    for i in 0..200 {
        arena.allocate_aligned(16 + i);
    }
    let allocated = arena.space_allocated();
    assert_eq!(allocated, memory.allocated() as u64);

    let released = arena.reset();

    assert_eq!(released, allocated);
    assert_eq!(collector.resets(), vec![allocated]);
    assert_eq!(memory.released() as u64, allocated);
    // Only the fresh block holding the policy is live again.
    assert_eq!(memory.live_blocks(), 1);
    assert_eq!(arena.space_used(), 0);

    drop(arena);
    assert_eq!(memory.live_blocks(), 0);
    assert_eq!(collector.destroys().len(), 1);
}

#[test]
fn test_values_survive_until_reset() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut arena = Arena::new();

    {
        let kept = arena.alloc(vec![DropCounter(drops.clone()), DropCounter(drops.clone())]);
        kept.push(DropCounter(drops.clone()));
        let owned = arena.own(Box::new(DropCounter(drops.clone())));
        let _ = owned;
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    arena.reset();
    assert_eq!(drops.load(Ordering::SeqCst), 4);

    drop(arena);
    assert_eq!(drops.load(Ordering::SeqCst), 4);
}

#[test]
fn test_caller_block_is_never_released() {
    let memory = CountingMemory::new();
    let collector = RecordingCollector::new();
    let mut buf = AlignedBuffer::<4096>::new();
    let range = buf.address_range();

    {
        let arena = Arena::with_initial_block_and_policy(
            &mut buf.0,
            instrumented_policy(&memory, &collector),
        );

        let first = arena.allocate_aligned(16).as_ptr() as usize;
        assert!(range.contains(&first));
        assert_eq!(arena.space_allocated(), 4096);
        assert_eq!(memory.allocated(), 0);

        for _ in 0..100 {
            arena.allocate_aligned(512);
        }
        assert!(memory.allocated() > 0);
    }

    // The counting source asserts on any pointer it did not hand out, so
    // reaching here means the buffer was never passed to `release`.
    assert_eq!(memory.live_blocks(), 0);
    assert_eq!(
        collector.destroys(),
        vec![4096 + memory.allocated() as u64]
    );
}

#[test]
fn test_caller_block_is_reused_after_reset() {
    let memory = CountingMemory::new();
    let collector = RecordingCollector::new();
    let mut buf = AlignedBuffer::<2048>::new();
    let range = buf.address_range();

    let mut arena = Arena::with_initial_block_and_policy(
        &mut buf.0,
        instrumented_policy(&memory, &collector),
    );
    for _ in 0..50 {
        arena.allocate_aligned(256);
    }
    let from_source = memory.allocated() as u64;

    let released = arena.reset();
    assert_eq!(released, 2048 + from_source);
    assert_eq!(collector.resets(), vec![2048 + from_source]);
    assert_eq!(memory.live_blocks(), 0);

    assert_eq!(arena.space_allocated(), 2048);
    let again = arena.allocate_aligned(16).as_ptr() as usize;
    assert!(range.contains(&again));
}

#[test]
fn test_small_caller_block_is_ignored() {
    let memory = CountingMemory::new();
    let collector = RecordingCollector::new();
    let mut buf = AlignedBuffer::<{ MIN_INITIAL_BLOCK_SIZE }>::new();

    // Large enough without a policy, too small to also hold one.
    assert!(MIN_INITIAL_BLOCK_SIZE < MIN_INITIAL_BLOCK_SIZE_WITH_POLICY);
    let arena = Arena::with_initial_block_and_policy(
        &mut buf.0,
        instrumented_policy(&memory, &collector),
    );

    assert_eq!(memory.live_blocks(), 1);
    assert_eq!(arena.space_allocated(), memory.allocated() as u64);
    drop(arena);
    assert_eq!(memory.live_blocks(), 0);
}

#[test]
fn test_minimum_caller_block_without_policy() {
    let mut buf = AlignedBuffer::<{ MIN_INITIAL_BLOCK_SIZE + 64 }>::new();
    let range = buf.address_range();
    let arena = Arena::with_initial_block(&mut buf.0);

    let ptr = arena.allocate_aligned(64).as_ptr() as usize;
    assert!(range.contains(&ptr));

    // The buffer is now full; the next request needs a system block.
    let ptr = arena.allocate_aligned(8).as_ptr() as usize;
    assert!(!range.contains(&ptr));
}

#[test]
fn test_policy_block_serves_allocations() {
    let memory = CountingMemory::new();
    let collector = RecordingCollector::new();
    let arena = Arena::with_policy(instrumented_policy(&memory, &collector));

    assert_eq!(memory.block_sizes().len(), 1);
    arena.allocate_aligned(16);
    assert_eq!(memory.block_sizes().len(), 1);
    assert_eq!(arena.space_used(), 16);
}

#[test]
fn test_default_policy_matches_plain_arena_growth() {
    let plain = Arena::new();
    let configured = Arena::with_policy(AllocationPolicy::default());

    for _ in 0..10 {
        plain.allocate_aligned(1000);
        configured.allocate_aligned(1000);
    }
    assert_eq!(plain.space_used(), configured.space_used());
}
