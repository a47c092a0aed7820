//! Strata region allocator
//!
//! This crate provides a thread-safe arena for high-throughput allocation of
//! many short-lived objects that are released together:
//!
//! - **Per-thread bump arenas**: each allocating thread gets its own chain
//!   of blocks, found through a thread-local cache with no shared writes
//! - **Lock-free registry**: per-thread arenas are published with a CAS
//!   loop and never unlinked until the arena is reset or dropped
//! - **Deferred cleanup**: destructors are recorded inside the same blocks
//!   and run once, in bulk, on reset or drop
//! - **Pluggable policy**: block growth, memory source and metrics hooks
//!   (see [`AllocationPolicy`])
//!
//! # Examples
//!
//! ```
//! use std::thread;
//! use strata_arena::Arena;
//!
//! let arena = Arena::new();
//!
//! thread::scope(|s| {
//!     for i in 0..4u64 {
//!         let arena = &arena;
//!         s.spawn(move || {
//!             let value = arena.alloc(i * 10);
//!             assert_eq!(*value, i * 10);
//!         });
//!     }
//! });
//!
//! assert_eq!(arena.owners().len(), 4);
//! ```
//!
//! # Logging
//!
//! Diagnostics go through `strata-log`; set `STRATA_LOG=trace` and call
//! [`strata_log::init_from_env`] to see block acquisition and registration.

mod arena;
mod block;
mod error;
mod policy;
mod serial;
mod thread_cache;
mod thread_safe;

pub use arena::Arena;
pub use block::{BLOCK_HEADER_SIZE, next_block_size};
pub use error::{ArenaError, Result};
pub use policy::{
    AllocationPolicy, BLOCK_ALIGNMENT, DEFAULT_MAX_BLOCK_SIZE, DEFAULT_START_BLOCK_SIZE,
    MemorySource, MetricsCollector, SystemMemory,
};
pub use serial::CleanupSlot;
pub use thread_cache::{LifecycleId, OwnerId};
pub use thread_safe::{MIN_INITIAL_BLOCK_SIZE, MIN_INITIAL_BLOCK_SIZE_WITH_POLICY, ThreadSafeArena};
