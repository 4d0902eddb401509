//! Atomic types used in the shared segment.
//!
//! Re-exported so the whole crate picks one source: std atomics by
//! default, loom's under the `loom` feature for model-checking the slot
//! lock transitions. No blocking or spinning primitives live here; a
//! failed slot lock is surfaced to the caller, never waited out.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
