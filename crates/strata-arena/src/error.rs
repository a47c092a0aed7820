//! Error types for the arena allocator.
//!
//! The allocator has no recoverable failure modes. The conditions below are
//! programming errors detected by size arithmetic; the allocation entry points
//! turn them into a panic through [`fatal`] instead of returning them.

use std::fmt;

/// Conditions that make an arena operation impossible to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The requested size plus the fixed block overhead exceeds `usize::MAX`.
    SizeOverflow {
        /// The requested allocation size in bytes.
        requested: usize,
        /// The fixed overhead added to the request.
        overhead: usize,
    },

    /// The embedded allocation policy did not fit into the first block even
    /// though that block was sized to hold it.
    PolicyDoesNotFit {
        /// Bytes needed for the policy.
        required: usize,
        /// Bytes left in the first block.
        available: usize,
    },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::SizeOverflow {
                requested,
                overhead,
            } => write!(
                f,
                "arena allocation of {requested} bytes overflows with {overhead} bytes of overhead"
            ),
            ArenaError::PolicyDoesNotFit {
                required,
                available,
            } => write!(
                f,
                "allocation policy needs {required} bytes but the first block has {available}"
            ),
        }
    }
}

impl std::error::Error for ArenaError {}

/// Result type for arena size computations.
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Reports an unrecoverable allocator error and panics.
///
/// Build with `panic = "abort"` to make this a process abort.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fatal(err: ArenaError) -> ! {
    strata_log::error!("{err}");
    panic!("{err}");
}
