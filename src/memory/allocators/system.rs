/*!
 * System Fallback
 * Last-resort allocations from the process global allocator
 */

use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::types::{Address, Size};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use ahash::RandomState;
use dashmap::DashMap;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global-allocator passthrough that remembers each block's layout, so
/// ownership can be recovered from the address alone.
pub struct SystemAllocator {
    blocks: DashMap<Address, Layout, RandomState>,
    bytes: AtomicUsize,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self {
            blocks: DashMap::with_hasher(RandomState::new()),
            bytes: AtomicUsize::new(0),
        }
    }

    pub fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: layout size is non-zero
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.blocks.insert(ptr.as_ptr() as Address, layout);
        self.bytes.fetch_add(layout.size(), Ordering::Relaxed);
        Some(ptr)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let (_, layout) = self
            .blocks
            .remove(&address)
            .ok_or(MemoryError::ForeignPointer {
                address,
                owner: "system allocator",
            })?;
        // SAFETY: the block came from `alloc` with this layout and was just
        // unregistered, so it is freed exactly once
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        self.bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        Ok(())
    }

    pub fn owns(&self, address: Address) -> bool {
        self.blocks.contains_key(&address)
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn bytes(&self) -> Size {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        for entry in self.blocks.iter() {
            // SAFETY: every registered block is still owned by us
            unsafe { alloc::dealloc(*entry.key() as *mut u8, *entry.value()) };
        }
    }
}

impl BlockAllocator for SystemAllocator {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        SystemAllocator::allocate(self, size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        SystemAllocator::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        SystemAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        let bytes = self.bytes();
        AllocatorUsage {
            capacity: bytes,
            used: bytes,
            live_blocks: self.live_blocks(),
        }
    }
}
