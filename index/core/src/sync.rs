//! Atomic type aliases and counter helpers.
//!
//! The rest of the crate pulls its atomics from here rather than from
//! `std` directly, so the `loom` feature can swap in loom's model-checked
//! equivalents for concurrency tests without touching any call site.
//! Also home to [`fetch_add_signed`], which the statistics counters use
//! to apply mutation deltas that can go in either direction.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// Apply a signed delta to an unsigned counter.
///
/// Counters are tracked as `usize` but mutations produce signed deltas
/// (an eviction shrinks `mem_size`, an insert grows it). Two's-complement
/// wrapping makes `fetch_add` with the reinterpreted delta equivalent to
/// add-or-subtract.
#[inline]
pub fn fetch_add_signed(counter: &AtomicUsize, delta: isize) {
    counter.fetch_add(delta as usize, Ordering::Relaxed);
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_add_signed_roundtrip() {
        let counter = AtomicUsize::new(100);
        fetch_add_signed(&counter, 50);
        assert_eq!(counter.load(Ordering::Relaxed), 150);
        fetch_add_signed(&counter, -150);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
