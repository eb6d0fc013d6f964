/*!
 * Memory Traits
 * Allocator and pool abstractions used by the manager's dispatch
 */

use super::types::{AllocatorUsage, PoolStats};
use crate::core::errors::MemoryResult;
use crate::core::types::{Address, Size};
use std::ptr::NonNull;

/// Variable-size block allocator interface.
///
/// Every strategy allocator implements this so the manager can route a
/// request, and later its release, through the same contract.
pub trait BlockAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    /// Returns `None` on exhaustion; never blocks indefinitely.
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>>;

    /// Release a block previously returned by `allocate` on this allocator
    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()>;

    /// Whether `address` lies inside storage owned by this allocator
    fn owns(&self, address: Address) -> bool;

    /// Current usage of the backing storage
    fn usage(&self) -> AllocatorUsage;
}

/// Fixed-slot pool interface.
///
/// Used for the size-class pools and for caller-registered custom pools.
pub trait Pool: Send + Sync {
    /// Usable bytes per slot
    fn slot_size(&self) -> Size;

    /// Guaranteed alignment of every slot
    fn slot_align(&self) -> usize;

    /// Pop a free slot, `None` when exhausted
    fn allocate(&self) -> Option<NonNull<u8>>;

    /// Return a slot; foreign pointers and double frees are rejected
    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()>;

    fn owns(&self, address: Address) -> bool;

    fn stats(&self) -> PoolStats;

    /// Release unused backing storage, returning bytes freed
    fn try_shrink(&self) -> Size {
        0
    }
}
