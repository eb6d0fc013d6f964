/*!
 * Linear Allocator
 * Bump-pointer arena with O(1) bulk reset
 *
 * Blocks are carved by advancing an offset; there is no per-object free.
 * Use it only for objects that share one lifetime (a frame, a load phase):
 * mixing lifetimes is a caller discipline the arena does not enforce.
 * Block starts are remembered until the next rewind, so interior pointers
 * and repeated releases are rejected before they can trigger a rewind.
 *
 * Alignment: 16 bytes by default, any power of two via `allocate_aligned`.
 * Padding counts against capacity.
 */

use super::region::Region;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::DEFAULT_ALIGNMENT;
use crate::core::types::{checked_align_up, Address, Size};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use ahash::RandomState;
use dashmap::DashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const EPOCH_MASK: u64 = (1 << (64 - OFFSET_BITS)) - 1;

/// Largest arena the packed state word can describe (1TB)
pub const MAX_LINEAR_CAPACITY: Size = OFFSET_MASK as Size;

#[inline]
fn pack(epoch: u64, offset: usize) -> u64 {
    ((epoch & EPOCH_MASK) << OFFSET_BITS) | offset as u64
}

#[inline]
fn unpack(state: u64) -> (u64, usize) {
    (state >> OFFSET_BITS, (state & OFFSET_MASK) as usize)
}

/// Thread-safe bump allocator.
///
/// The offset shares one atomic word with a reset epoch, so a rewind can
/// never be confused with a concurrent bump that happened to land on the
/// same offset.
pub struct LinearAllocator {
    region: Region,
    /// epoch (24 bits) | offset (40 bits)
    state: AtomicU64,
    live: AtomicUsize,
    /// Block start -> still live
    starts: DashMap<Address, bool, RandomState>,
    allocations: AtomicU64,
    failed: AtomicU64,
    resets: AtomicU64,
}

impl LinearAllocator {
    pub fn new(capacity: Size) -> MemoryResult<Self> {
        if capacity > MAX_LINEAR_CAPACITY {
            return Err(MemoryError::InvalidConfig(format!(
                "linear arena capacity {capacity} exceeds {MAX_LINEAR_CAPACITY}"
            )));
        }
        Ok(Self {
            region: Region::new(capacity)?,
            state: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            starts: DashMap::with_hasher(RandomState::new()),
            allocations: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        })
    }

    /// Allocate `size` bytes with the default 16-byte alignment
    #[inline]
    pub fn allocate(&self, size: Size) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `align`.
    /// Returns `None` once the remaining capacity (after padding) is short.
    pub fn allocate_aligned(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        // Zero-byte requests still consume a byte so every pointer is distinct
        let size = size.max(1);
        let base = self.region.base();
        let capacity = self.region.capacity();

        // Announce the allocation before touching the offset; see `rewind_if_idle`
        self.live.fetch_add(1, Ordering::AcqRel);

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (epoch, offset) = unpack(current);
            let start = match checked_align_up(base + offset, align) {
                Some(aligned) => aligned - base,
                None => break,
            };
            let end = match start.checked_add(size) {
                Some(end) if end <= capacity => end,
                _ => break,
            };

            match self.state.compare_exchange_weak(
                current,
                pack(epoch, end),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    self.starts.insert(base + start, true);
                    return Some(self.region.ptr_at(start));
                }
                Err(actual) => current = actual,
            }
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Rewind the offset to zero in O(1).
    ///
    /// Every block handed out before the reset becomes invalid; the caller
    /// guarantees none is still in use.
    pub fn reset(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let (epoch, _) = unpack(state);
                Some(pack(epoch + 1, 0))
            });
        self.live.store(0, Ordering::Release);
        self.starts.clear();
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one block as no longer used.
    ///
    /// Memory is not reclaimed per block; once the last live block is
    /// released the arena rewinds itself.
    pub fn release(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        if !self.owns(address) {
            return Err(MemoryError::ForeignPointer {
                address,
                owner: "linear arena",
            });
        }

        match self.starts.get_mut(&address) {
            Some(mut live) if *live => *live = false,
            Some(_) => return Err(MemoryError::DoubleFree(address)),
            None => return Err(MemoryError::InvalidFree(address)),
        }

        let previous = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1))
            .map_err(|_| MemoryError::InvalidFree(address))?;

        if previous == 1 {
            self.rewind_if_idle();
        }
        Ok(())
    }

    /// Rewind the offset when no block is live.
    ///
    /// Allocation bumps `live` before reading the state word, and a rewind
    /// only succeeds if the state word is unchanged after observing
    /// `live == 0`, so a concurrent bump always wins.
    pub fn rewind_if_idle(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if self.live.load(Ordering::Acquire) != 0 {
            return false;
        }
        let (epoch, offset) = unpack(current);
        if offset == 0 {
            return false;
        }
        let rewound = self
            .state
            .compare_exchange(
                current,
                pack(epoch + 1, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if rewound {
            // Blocks bumped after the rewind are still marked live and stay
            self.starts.retain(|_, live| *live);
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
        rewound
    }

    #[inline]
    pub fn owns(&self, address: Address) -> bool {
        self.region.contains(address)
    }

    /// Bytes consumed including padding
    pub fn used(&self) -> Size {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub fn remaining(&self) -> Size {
        self.capacity() - self.used()
    }

    pub fn capacity(&self) -> Size {
        self.region.capacity()
    }

    pub fn live_blocks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl BlockAllocator for LinearAllocator {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.release(ptr)
    }

    fn owns(&self, address: Address) -> bool {
        LinearAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        AllocatorUsage {
            capacity: self.capacity(),
            used: self.used(),
            live_blocks: self.live_blocks(),
        }
    }
}

impl std::fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("live", &self.live_blocks())
            .finish()
    }
}
