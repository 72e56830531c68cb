//! Global memory budget for stream buffers.
//!
//! Buffers reserve memory in fixed-size blocks. The manager never blocks or
//! queues callers: a request returns at most one block, or nothing when the
//! budget is exhausted, and the caller retries after a back-off.
//!
//! Both operations run under one short critical section so the
//! read-modify-write of the allocated total can never tear.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::MemorySettings;

/// Tracks bytes reserved by buffers against a fixed budget.
#[derive(Debug)]
pub struct MemoryManager {
    max_memory_bytes: u64,
    block_size_bytes: u64,
    /// Signed so that over-release is observable rather than wrapping.
    allocated: Mutex<i64>,
}

impl MemoryManager {
    /// Creates a manager with the given budget and block size.
    pub fn new(max_memory_bytes: u64, block_size_bytes: u64) -> Self {
        Self {
            max_memory_bytes,
            block_size_bytes,
            allocated: Mutex::new(0),
        }
    }

    /// Creates a manager from memory settings.
    pub fn from_settings(settings: &MemorySettings) -> Self {
        Self::new(settings.max_memory_bytes, settings.block_size_bytes)
    }

    /// Reserves up to one block.
    ///
    /// Returns `min(block_size, max - allocated)`, or 0 once the budget is
    /// exhausted.
    pub fn request_memory(&self) -> u64 {
        let mut allocated = self.allocated.lock();
        let max = clamp_i64(self.max_memory_bytes);
        if *allocated >= max {
            debug!(
                allocated = *allocated,
                max = self.max_memory_bytes,
                "Memory budget exhausted"
            );
            return 0;
        }

        let grant = clamp_i64(self.block_size_bytes).min(max - *allocated);
        *allocated += grant;
        debug!(
            granted = grant,
            allocated = *allocated,
            max = self.max_memory_bytes,
            "Memory block reserved"
        );
        grant as u64
    }

    /// Returns bytes to the budget.
    ///
    /// Releasing more than was reserved is logged, not fatal.
    pub fn free(&self, bytes: u64) {
        let mut allocated = self.allocated.lock();
        *allocated -= clamp_i64(bytes);
        if *allocated < 0 {
            warn!(
                freed = bytes,
                allocated = *allocated,
                "Freed more memory than was allocated"
            );
        }
    }

    /// Bytes currently reserved. Negative after an over-release.
    pub fn current_memory_bytes(&self) -> i64 {
        *self.allocated.lock()
    }

    /// Configured budget.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Configured block size.
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_request_grants_one_block() {
        let manager = MemoryManager::new(100 * MB, 10 * MB);
        assert_eq!(manager.request_memory(), 10 * MB);
        assert_eq!(manager.current_memory_bytes(), (10 * MB) as i64);
    }

    #[test]
    fn test_request_grants_remainder_near_budget() {
        let manager = MemoryManager::new(25 * MB, 10 * MB);
        assert_eq!(manager.request_memory(), 10 * MB);
        assert_eq!(manager.request_memory(), 10 * MB);
        assert_eq!(manager.request_memory(), 5 * MB);
        assert_eq!(manager.request_memory(), 0);
    }

    #[test]
    fn test_free_makes_budget_available_again() {
        let manager = MemoryManager::new(10 * MB, 10 * MB);
        assert_eq!(manager.request_memory(), 10 * MB);
        assert_eq!(manager.request_memory(), 0);
        manager.free(4 * MB);
        assert_eq!(manager.request_memory(), 4 * MB);
    }

    #[test]
    fn test_over_release_goes_negative_without_failing() {
        let manager = MemoryManager::new(10 * MB, MB);
        manager.request_memory();
        manager.free(3 * MB);
        assert_eq!(manager.current_memory_bytes(), -2 * MB as i64);

        // The next request still respects max - allocated.
        assert_eq!(manager.request_memory(), MB);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request,
        Free(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Request), (0u64..(4 * MB)).prop_map(Op::Free)]
    }

    proptest! {
        #[test]
        fn test_conservation(ops in prop::collection::vec(op_strategy(), 1..200),
                             max in (1u64..64).prop_map(|m| m * MB),
                             block in (1u64..16).prop_map(|b| b * MB)) {
            let manager = MemoryManager::new(max, block);
            // Mirror of what callers legitimately hold, to free only what was granted.
            let mut held: u64 = 0;

            for op in ops {
                match op {
                    Op::Request => {
                        let before = manager.current_memory_bytes();
                        let grant = manager.request_memory();
                        let headroom = (max as i64 - before).max(0) as u64;
                        prop_assert!(grant <= block.min(headroom));
                        held += grant;
                    }
                    Op::Free(bytes) => {
                        let bytes = bytes.min(held);
                        manager.free(bytes);
                        held -= bytes;
                    }
                }
                let current = manager.current_memory_bytes();
                prop_assert!(current >= 0);
                prop_assert!(current as u64 <= max);
                prop_assert_eq!(current as u64, held);
            }
        }
    }
}
