/*!
 * Manager Counters
 * Independent atomics; snapshots are best-effort, never torn
 */

use crate::core::types::Size;
use crate::memory::types::AllocationStrategy;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(super) struct ManagerCounters {
    pub total_allocations: AtomicU64,
    pub total_deallocations: AtomicU64,
    pub failed_allocations: AtomicU64,
    pub fallback_allocations: AtomicU64,
    pub zero_size_allocations: AtomicU64,
    pub total_allocated_bytes: AtomicU64,
    pub current_bytes: AtomicUsize,
    pub peak_bytes: AtomicUsize,
    by_strategy: [AtomicU64; AllocationStrategy::ALL.len()],
}

impl ManagerCounters {
    /// Account a successful allocation, returning live bytes afterwards
    pub fn record_allocation(&self, size: Size, strategy: Option<AllocationStrategy>) -> Size {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_allocated_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        if let Some(strategy) = strategy {
            self.by_strategy[strategy as usize].fetch_add(1, Ordering::Relaxed);
        }
        let current = self.current_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);
        current
    }

    /// Account a release of `size` bytes (0 when unknown), returning live
    /// bytes afterwards
    pub fn record_deallocation(&self, size: Size) -> Size {
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        if size == 0 {
            return self.current();
        }
        let previous = self
            .current_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_sub(size)
    }

    pub fn record_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> Size {
        self.current_bytes.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> Size {
        self.peak_bytes.load(Ordering::Relaxed).max(self.current())
    }

    pub fn strategy_counts(&self) -> BTreeMap<AllocationStrategy, u64> {
        AllocationStrategy::ALL
            .iter()
            .map(|&strategy| {
                (
                    strategy,
                    self.by_strategy[strategy as usize].load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Zero everything except live bytes; the peak restarts from them
    pub fn reset(&self) {
        self.total_allocations.store(0, Ordering::Relaxed);
        self.total_deallocations.store(0, Ordering::Relaxed);
        self.failed_allocations.store(0, Ordering::Relaxed);
        self.fallback_allocations.store(0, Ordering::Relaxed);
        self.zero_size_allocations.store(0, Ordering::Relaxed);
        self.total_allocated_bytes.store(0, Ordering::Relaxed);
        self.peak_bytes.store(self.current(), Ordering::Relaxed);
        for counter in &self.by_strategy {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
