//! Process-local monotonic handler-id allocation.
//!
//! A single [`IdAllocator`] is shared by the event trie, the command trie, and
//! the remote bridge so that registration ids form one namespace: callers can
//! hand any id returned by any of the three registries to `unregister` without
//! knowing which one issued it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel returned by a unique-mode registration that was refused because
/// the exact triple already had a handler.
pub const REFUSED: u64 = 0;

#[derive(Clone, Debug, Default)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Allocate the next id. Never returns [`REFUSED`] and never reuses a
    /// previously issued value, even after the handler it named was
    /// unregistered.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_increasing_and_never_zero() {
        let alloc = IdAllocator::new();
        let mut prev = REFUSED;
        for _ in 0..1000 {
            let id = alloc.next();
            assert_ne!(id, REFUSED);
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn shared_clones_see_one_sequence() {
        let alloc = IdAllocator::new();
        let other = alloc.clone();
        let a = alloc.next();
        let b = other.next();
        let c = alloc.next();
        assert_eq!([a, b, c], [1, 2, 3]);
    }
}
