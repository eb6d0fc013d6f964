/*!
 * General-Purpose Heap
 * Region-backed allocator over a segregated free list
 *
 * - Small blocks (<8KB): power-of-two buckets from 16 bytes
 * - Medium blocks (8KB-64KB): 4KB-increment buckets
 * - Large blocks (>64KB): BTreeMap keyed by size, O(log n)
 *
 * Freed blocks are split on reuse and coalesced every
 * `DEALLOC_COALESCE_INTERVAL` frees, or when an allocation would otherwise
 * fail. A coalesced block touching the bump frontier retracts it.
 */

use super::region::Region;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{DEALLOC_COALESCE_INTERVAL, HEAP_GRANULARITY, MEDIUM_BLOCK_MAX};
use crate::core::types::{align_up, checked_align_up, Address, Size};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Free block, as an offset into the heap region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: Size,
}

/// Live block; the user pointer may sit past `offset` for over-aligned requests
#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    offset: usize,
    size: Size,
}

const SMALL_BUCKETS: usize = 9; // 16, 32, 64, ..., 4096
const MEDIUM_BUCKETS: usize = 15; // 8KB, 12KB, ..., 64KB
const NUM_BUCKETS: usize = SMALL_BUCKETS + MEDIUM_BUCKETS;
const SMALL_LIMIT: Size = 8 * 1024;
/// Entries inspected in the request's own bucket before moving up
const SAME_BUCKET_SCAN: usize = 16;

/// Bucket holding blocks of `size` (blocks are filed by rounding down)
fn floor_bucket(size: Size) -> Option<usize> {
    if size < SMALL_LIMIT {
        let size = size.max(HEAP_GRANULARITY);
        let log = (usize::BITS - 1 - size.leading_zeros()) as usize;
        Some(log - 4)
    } else if size <= MEDIUM_BLOCK_MAX {
        Some(SMALL_BUCKETS + size / 4096 - 2)
    } else {
        None
    }
}

/// First bucket whose every block can serve `size`
fn ceil_bucket(size: Size) -> Option<usize> {
    if size <= SMALL_LIMIT / 2 {
        let size = size.max(HEAP_GRANULARITY).next_power_of_two();
        Some(size.trailing_zeros() as usize - 4)
    } else if size <= MEDIUM_BLOCK_MAX {
        Some(SMALL_BUCKETS + size.div_ceil(4096).max(2) - 2)
    } else {
        None
    }
}

#[derive(Debug)]
struct SegregatedFreeList {
    buckets: Vec<Vec<FreeBlock>>,
    large: BTreeMap<Size, Vec<FreeBlock>>,
    len: usize,
    bytes: Size,
}

impl SegregatedFreeList {
    fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); NUM_BUCKETS],
            large: BTreeMap::new(),
            len: 0,
            bytes: 0,
        }
    }

    fn insert(&mut self, block: FreeBlock) {
        match floor_bucket(block.size) {
            Some(index) => self.buckets[index].push(block),
            None => self.large.entry(block.size).or_default().push(block),
        }
        self.len += 1;
        self.bytes += block.size;
    }

    fn take(&mut self, block: FreeBlock) -> FreeBlock {
        self.len -= 1;
        self.bytes -= block.size;
        block
    }

    fn find_best_fit(&mut self, size: Size) -> Option<FreeBlock> {
        // Blocks filed in the request's own bucket may be too small
        if let Some(index) = floor_bucket(size) {
            let bucket = &mut self.buckets[index];
            let start = bucket.len().saturating_sub(SAME_BUCKET_SCAN);
            if let Some(pos) = bucket[start..].iter().rposition(|b| b.size >= size) {
                let block = bucket.swap_remove(start + pos);
                return Some(self.take(block));
            }
        }

        if let Some(start) = ceil_bucket(size) {
            for index in start..NUM_BUCKETS {
                if let Some(block) = self.buckets[index].pop() {
                    return Some(self.take(block));
                }
            }
        }

        let key = self.large.range(size..).next().map(|(key, _)| *key)?;
        let blocks = self.large.get_mut(&key)?;
        let block = blocks.pop()?;
        if blocks.is_empty() {
            self.large.remove(&key);
        }
        Some(self.take(block))
    }

    fn drain_sorted(&mut self) -> Vec<FreeBlock> {
        let mut all = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            all.append(bucket);
        }
        for (_, mut blocks) in std::mem::take(&mut self.large) {
            all.append(&mut blocks);
        }
        self.len = 0;
        self.bytes = 0;
        all.sort_unstable_by_key(|b| b.offset);
        all
    }
}

#[derive(Debug)]
struct HeapState {
    free: SegregatedFreeList,
    /// Bytes past this offset have never been handed out
    frontier: usize,
    live: HashMap<usize, LiveBlock, RandomState>,
    used: Size,
    frees_since_coalesce: u64,
}

impl HeapState {
    /// Merge adjacent free blocks; returns how many free entries disappeared
    fn coalesce(&mut self) -> usize {
        let blocks = self.free.drain_sorted();
        let before = blocks.len();
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(before);

        for block in blocks {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == block.offset => last.size += block.size,
                _ => merged.push(block),
            }
        }
        if let Some(last) = merged.last() {
            if last.offset + last.size == self.frontier {
                self.frontier = last.offset;
                merged.pop();
            }
        }

        let merges = before.saturating_sub(merged.len());
        for block in merged {
            self.free.insert(block);
        }
        self.frees_since_coalesce = 0;
        merges
    }
}

/// Thread-safe general-purpose heap.
///
/// Native alignment is 16 bytes; larger alignments over-allocate and
/// remember the block start. Frees do not need the caller's size.
pub struct FreeListAllocator {
    region: Region,
    state: Mutex<HeapState>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    failed: AtomicU64,
    coalesces: AtomicU64,
}

impl FreeListAllocator {
    pub fn new(capacity: Size) -> MemoryResult<Self> {
        Ok(Self {
            region: Region::new(capacity)?,
            state: Mutex::new(HeapState {
                free: SegregatedFreeList::new(),
                frontier: 0,
                live: HashMap::with_hasher(RandomState::new()),
                used: 0,
                frees_since_coalesce: 0,
            }),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            coalesces: AtomicU64::new(0),
        })
    }

    pub fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        let padded = checked_align_up(size.max(1), HEAP_GRANULARITY)?;
        let need = if align <= HEAP_GRANULARITY {
            padded
        } else {
            padded.checked_add(align - HEAP_GRANULARITY)?
        };
        let base = self.region.base();
        let capacity = self.region.capacity();

        let mut state = self.state.lock();
        let block = match Self::carve(&mut state, need, capacity) {
            Some(block) => block,
            None => {
                if state.coalesce() > 0 {
                    self.coalesces.fetch_add(1, Ordering::Relaxed);
                }
                match Self::carve(&mut state, need, capacity) {
                    Some(block) => block,
                    None => {
                        drop(state);
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                }
            }
        };

        let user_offset = align_up(base + block.offset, align) - base;
        state.live.insert(
            user_offset,
            LiveBlock {
                offset: block.offset,
                size: block.size,
            },
        );
        state.used += block.size;
        drop(state);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(self.region.ptr_at(user_offset))
    }

    /// Take `need` bytes from the free list or the frontier, splitting off
    /// any remainder
    fn carve(state: &mut HeapState, need: Size, capacity: Size) -> Option<FreeBlock> {
        if let Some(mut block) = state.free.find_best_fit(need) {
            let remainder = block.size - need;
            if remainder >= HEAP_GRANULARITY {
                state.free.insert(FreeBlock {
                    offset: block.offset + need,
                    size: remainder,
                });
                block.size = need;
            }
            return Some(block);
        }

        let end = state.frontier.checked_add(need)?;
        if end > capacity {
            return None;
        }
        let block = FreeBlock {
            offset: state.frontier,
            size: need,
        };
        state.frontier = end;
        Some(block)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let offset = self
            .region
            .offset_of(address)
            .ok_or(MemoryError::ForeignPointer {
                address,
                owner: "general heap",
            })?;

        let mut state = self.state.lock();
        let block = state
            .live
            .remove(&offset)
            .ok_or(MemoryError::InvalidFree(address))?;
        state.free.insert(FreeBlock {
            offset: block.offset,
            size: block.size,
        });
        state.used -= block.size;
        state.frees_since_coalesce += 1;
        let coalesced =
            state.frees_since_coalesce >= DEALLOC_COALESCE_INTERVAL && state.coalesce() > 0;
        drop(state);

        if coalesced {
            self.coalesces.fetch_add(1, Ordering::Relaxed);
        }
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Merge adjacent free blocks now; returns how many free entries disappeared
    pub fn coalesce(&self) -> usize {
        let merges = self.state.lock().coalesce();
        if merges > 0 {
            self.coalesces.fetch_add(1, Ordering::Relaxed);
        }
        merges
    }

    /// Usable bytes behind a live pointer
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<Size> {
        let offset = self.region.offset_of(ptr.as_ptr() as Address)?;
        let state = self.state.lock();
        state
            .live
            .get(&offset)
            .map(|block| block.offset + block.size - offset)
    }

    #[inline]
    pub fn owns(&self, address: Address) -> bool {
        self.region.contains(address)
    }

    pub fn capacity(&self) -> Size {
        self.region.capacity()
    }

    pub fn used(&self) -> Size {
        self.state.lock().used
    }

    pub fn free_block_count(&self) -> usize {
        self.state.lock().free.len
    }

    /// Bytes never handed out plus bytes on the free list
    pub fn available(&self) -> Size {
        let state = self.state.lock();
        self.region.capacity() - state.frontier + state.free.bytes
    }

    pub fn coalesce_count(&self) -> u64 {
        self.coalesces.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl BlockAllocator for FreeListAllocator {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        FreeListAllocator::allocate(self, size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        FreeListAllocator::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        FreeListAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        let state = self.state.lock();
        AllocatorUsage {
            capacity: self.region.capacity(),
            used: state.used,
            live_blocks: state.live.len(),
        }
    }
}

impl std::fmt::Debug for FreeListAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}
