/*!
 * Backing Regions
 * Owned, aligned raw memory reserved from the global allocator
 */

use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::CACHE_LINE_SIZE;
use crate::core::types::{Address, Size};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A contiguous block of memory owned by exactly one allocator.
///
/// The region only hands out raw pointers; coordinating writes to the bytes
/// is the owning allocator's job.
pub struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a Region is a uniquely owned heap block; it is freed once in Drop
// and carries no thread affinity.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve `capacity` bytes aligned to a cache line
    pub fn new(capacity: Size) -> MemoryResult<Self> {
        Self::with_alignment(capacity, CACHE_LINE_SIZE)
    }

    pub fn with_alignment(capacity: Size, align: usize) -> MemoryResult<Self> {
        if capacity == 0 {
            return Err(MemoryError::InvalidConfig(
                "region capacity must be non-zero".into(),
            ));
        }
        let layout = Layout::from_size_align(capacity, align.max(CACHE_LINE_SIZE))
            .map_err(|_| MemoryError::InvalidAlignment(align))?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(MemoryError::OutOfMemory {
            requested: capacity,
            available: 0,
        })?;

        Ok(Self { base, layout })
    }

    #[inline]
    pub fn base(&self) -> Address {
        self.base.as_ptr() as Address
    }

    #[inline]
    pub fn capacity(&self) -> Size {
        self.layout.size()
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.base() + self.capacity()
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base() && address < self.end()
    }

    /// Offset of `address` from the region base, if inside
    #[inline]
    pub fn offset_of(&self, address: Address) -> Option<usize> {
        self.contains(address).then(|| address - self.base())
    }

    /// Pointer `offset` bytes into the region.
    ///
    /// Callers keep `offset < capacity`; the allocators only derive offsets
    /// from their own bookkeeping.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.capacity(), "offset {offset} out of region");
        // SAFETY: offset stays within the allocation, so the result is non-null
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: base was allocated with exactly this layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("0x{:x}", self.base()))
            .field("capacity", &self.capacity())
            .finish()
    }
}
