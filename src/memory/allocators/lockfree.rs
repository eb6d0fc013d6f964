/*!
 * Lock-Free Block Allocator
 * Fixed-size blocks on a Treiber stack with a tagged head
 *
 * ABA mitigation: the free list links block indices, not pointers, and the
 * head word packs a 32-bit generation tag next to the index. Every
 * successful CAS bumps the tag, so a head that was popped and pushed back
 * between a reader's load and its CAS no longer compares equal.
 *
 * Links live in a side array rather than inside the blocks, so user writes
 * to a block can never corrupt the list.
 */

use super::region::Region;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::CACHE_LINE_SIZE;
use crate::core::types::{Address, Size};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const EMPTY: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Lock-free allocator of `BLOCK`-byte blocks.
///
/// Blocks sit at multiples of `BLOCK` from a base aligned to at least
/// `BLOCK`, so `BLOCK` is the strongest alignment they guarantee.
pub struct LockFreeAllocator<const BLOCK: usize> {
    region: Region,
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    allocated_flags: Box<[AtomicBool]>,
    capacity: usize,
    allocated: AtomicUsize,
    available: AtomicUsize,
    cas_retries: AtomicU64,
    failed: AtomicU64,
}

impl<const BLOCK: usize> LockFreeAllocator<BLOCK> {
    const VALID_BLOCK: () = assert!(
        BLOCK.is_power_of_two() && BLOCK >= 8,
        "block size must be a power of two of at least 8 bytes"
    );

    pub fn new(block_count: usize) -> MemoryResult<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_BLOCK;

        if block_count == 0 || block_count >= EMPTY as usize {
            return Err(MemoryError::InvalidConfig(format!(
                "lock-free block count {block_count} out of range"
            )));
        }
        let region = Region::with_alignment(block_count * BLOCK, BLOCK.max(CACHE_LINE_SIZE))?;

        // Initially every block is free and linked in address order
        let next: Box<[AtomicU32]> = (0..block_count)
            .map(|i| {
                let successor = if i + 1 < block_count { (i + 1) as u32 } else { EMPTY };
                AtomicU32::new(successor)
            })
            .collect();
        let allocated_flags = (0..block_count).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            region,
            head: AtomicU64::new(pack(0, 0)),
            next,
            allocated_flags,
            capacity: block_count,
            allocated: AtomicUsize::new(0),
            available: AtomicUsize::new(block_count),
            cas_retries: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Pop a block. Retries the CAS under contention; never blocks.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            if index == EMPTY {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            // A stale read here is harmless: the tag makes the CAS fail
            let next = self.next[index as usize].load(Ordering::Acquire);

            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let was_allocated =
                        self.allocated_flags[index as usize].swap(true, Ordering::AcqRel);
                    debug_assert!(!was_allocated, "free list yielded live block {index}");
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    return Some(self.region.ptr_at(index as usize * BLOCK));
                }
                Err(actual) => {
                    self.cas_retries.fetch_add(1, Ordering::Relaxed);
                    head = actual;
                }
            }
        }
    }

    /// Push a block back. Foreign, misaligned and already free blocks are
    /// rejected before the list is touched.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let index = self.block_index(address)?;

        if !self.allocated_flags[index].swap(false, Ordering::AcqRel) {
            return Err(MemoryError::DoubleFree(address));
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            self.next[index].store(top, Ordering::Release);

            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index as u32),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    self.cas_retries.fetch_add(1, Ordering::Relaxed);
                    head = actual;
                }
            }
        }

        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.available.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_index(&self, address: Address) -> MemoryResult<usize> {
        match self.region.offset_of(address) {
            Some(offset) if offset % BLOCK == 0 => Ok(offset / BLOCK),
            Some(_) => Err(MemoryError::InvalidFree(address)),
            None => Err(MemoryError::ForeignPointer {
                address,
                owner: "lock-free allocator",
            }),
        }
    }

    /// Inside the region and on a block boundary
    #[inline]
    pub fn owns(&self, address: Address) -> bool {
        self.region
            .offset_of(address)
            .is_some_and(|offset| offset % BLOCK == 0)
    }

    pub const fn block_size(&self) -> Size {
        BLOCK
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn available_count(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn cas_retries(&self) -> u64 {
        self.cas_retries.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Walk the free list and count its nodes.
    ///
    /// Only meaningful while no other thread is allocating or freeing;
    /// used to verify that no block was lost.
    pub fn free_list_len(&self) -> usize {
        let (_, mut index) = unpack(self.head.load(Ordering::Acquire));
        let mut count = 0;
        while index != EMPTY && count <= self.capacity {
            count += 1;
            index = self.next[index as usize].load(Ordering::Acquire);
        }
        count
    }
}

impl<const BLOCK: usize> BlockAllocator for LockFreeAllocator<BLOCK> {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        if size > BLOCK || align > BLOCK {
            return None;
        }
        LockFreeAllocator::allocate(self)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        LockFreeAllocator::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        LockFreeAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        let live = self.allocated_count();
        AllocatorUsage {
            capacity: self.capacity * BLOCK,
            used: live * BLOCK,
            live_blocks: live,
        }
    }
}

impl<const BLOCK: usize> std::fmt::Debug for LockFreeAllocator<BLOCK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeAllocator")
            .field("block", &BLOCK)
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}
