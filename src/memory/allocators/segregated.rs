/*!
 * Size-Segregated Pools
 * Growable slab pools bucketed by size class
 */

use super::object_pool::SlabPool;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{CACHE_LINE_SIZE, MAX_POOL_CHUNKS, MAX_SIZE_CLASS, SIZE_CLASSES};
use crate::core::types::{Address, Size};
use crate::memory::traits::{BlockAllocator, Pool};
use crate::memory::types::{AllocatorUsage, PoolStats};
use parking_lot::RwLock;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Chunks stop doubling after this many growth steps
const MAX_GROWTH_SHIFT: usize = 6;

/// Pool of one slot size that grows by adding slab chunks.
///
/// Chunk `n` holds `initial_slots << n` slots (capped), so capacity roughly
/// doubles per growth step. Empty chunks past the first can be released by
/// `try_shrink`.
pub struct DynamicPool {
    slot_size: Size,
    slot_align: usize,
    initial_slots: usize,
    max_chunks: usize,
    chunks: RwLock<Vec<SlabPool>>,
    grow_events: AtomicU64,
    shrink_events: AtomicU64,
    failed: AtomicU64,
}

impl DynamicPool {
    pub fn new(slot_size: Size, slot_align: usize, initial_slots: usize) -> MemoryResult<Self> {
        Self::with_max_chunks(slot_size, slot_align, initial_slots, MAX_POOL_CHUNKS)
    }

    pub fn with_max_chunks(
        slot_size: Size,
        slot_align: usize,
        initial_slots: usize,
        max_chunks: usize,
    ) -> MemoryResult<Self> {
        if max_chunks == 0 {
            return Err(MemoryError::InvalidConfig(
                "dynamic pool needs at least one chunk".into(),
            ));
        }
        let first = SlabPool::new(slot_size, slot_align, initial_slots)?;
        Ok(Self {
            slot_size: first.stride(),
            slot_align,
            initial_slots,
            max_chunks,
            chunks: RwLock::new(vec![first]),
            grow_events: AtomicU64::new(0),
            shrink_events: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn allocate(&self) -> Option<NonNull<u8>> {
        {
            let chunks = self.chunks.read();
            if let Some(ptr) = chunks.iter().rev().find_map(SlabPool::allocate) {
                return Some(ptr);
            }
        }
        self.grow_and_allocate()
    }

    fn grow_and_allocate(&self) -> Option<NonNull<u8>> {
        let mut chunks = self.chunks.write();
        // Another thread may have grown or freed while we waited
        if let Some(ptr) = chunks.iter().rev().find_map(SlabPool::allocate) {
            return Some(ptr);
        }
        if chunks.len() >= self.max_chunks {
            drop(chunks);
            self.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slots = self.initial_slots << chunks.len().min(MAX_GROWTH_SHIFT);
        let chunk = match SlabPool::new(self.slot_size, self.slot_align, slots) {
            Ok(chunk) => chunk,
            Err(_) => {
                drop(chunks);
                self.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let ptr = chunk.allocate();
        chunks.push(chunk);
        let chunk_count = chunks.len();
        drop(chunks);

        self.grow_events.fetch_add(1, Ordering::Relaxed);
        debug!(
            slot_size = self.slot_size,
            slots,
            chunks = chunk_count,
            "Dynamic pool grew"
        );
        ptr
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let chunks = self.chunks.read();
        match chunks.iter().find(|chunk| chunk.owns(address)) {
            Some(chunk) => chunk.deallocate(ptr),
            None => Err(MemoryError::ForeignPointer {
                address,
                owner: "dynamic pool",
            }),
        }
    }

    pub fn owns(&self, address: Address) -> bool {
        self.chunks.read().iter().any(|chunk| chunk.owns(address))
    }

    /// Drop empty chunks beyond the first, returning the bytes released
    pub fn try_shrink(&self) -> Size {
        let mut chunks = self.chunks.write();
        let before: Size = chunks.iter().map(SlabPool::reserved_bytes).sum();
        let mut index = 0;
        chunks.retain(|chunk| {
            index += 1;
            index == 1 || !chunk.is_empty()
        });
        let after: Size = chunks.iter().map(SlabPool::reserved_bytes).sum();
        drop(chunks);

        let freed = before - after;
        if freed > 0 {
            self.shrink_events.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    pub fn reserved_bytes(&self) -> Size {
        self.chunks.read().iter().map(SlabPool::reserved_bytes).sum()
    }
}

impl Pool for DynamicPool {
    fn slot_size(&self) -> Size {
        self.slot_size
    }

    fn slot_align(&self) -> usize {
        self.slot_align
    }

    fn allocate(&self) -> Option<NonNull<u8>> {
        DynamicPool::allocate(self)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        DynamicPool::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        DynamicPool::owns(self, address)
    }

    fn stats(&self) -> PoolStats {
        let chunks = self.chunks.read();
        let mut stats = PoolStats {
            slot_size: self.slot_size,
            chunks: chunks.len(),
            failed_allocations: self.failed.load(Ordering::Relaxed),
            grow_events: self.grow_events.load(Ordering::Relaxed),
            shrink_events: self.shrink_events.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for chunk in chunks.iter() {
            let chunk_stats = Pool::stats(chunk);
            stats.capacity += chunk_stats.capacity;
            stats.used += chunk_stats.used;
            stats.allocations += chunk_stats.allocations;
            stats.deallocations += chunk_stats.deallocations;
        }
        stats
    }

    fn try_shrink(&self) -> Size {
        DynamicPool::try_shrink(self)
    }
}

/// Natural alignment of slots in a class: the lowest set bit of the class
/// size, capped by the cache-line base alignment of every chunk.
#[inline]
fn class_alignment(class: Size) -> usize {
    (1usize << class.trailing_zeros()).min(CACHE_LINE_SIZE)
}

/// Smallest class that holds `size` bytes at `align`
pub fn size_class_index(size: Size, align: usize) -> Option<usize> {
    let size = size.max(1);
    SIZE_CLASSES
        .iter()
        .position(|&class| class >= size && class_alignment(class) >= align)
}

/// Set of dynamic pools, one per size class.
///
/// Requests round up to the nearest class whose natural alignment satisfies
/// the request. Anything above the largest class returns `None` so the
/// caller can fall back to a general allocator.
pub struct SegregatedPools {
    classes: Vec<DynamicPool>,
}

impl SegregatedPools {
    pub fn new(initial_slots: usize) -> MemoryResult<Self> {
        let classes = SIZE_CLASSES
            .iter()
            .map(|&class| {
                // Keep the first chunk of big classes modest
                let slots = (initial_slots * SIZE_CLASSES[0] / class).max(16);
                DynamicPool::new(class, class_alignment(class), slots)
            })
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self { classes })
    }

    pub fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        if size > MAX_SIZE_CLASS {
            return None;
        }
        let index = size_class_index(size, align)?;
        self.classes[index].allocate()
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        match self.classes.iter().find(|pool| pool.owns(address)) {
            Some(pool) => pool.deallocate(ptr),
            None => Err(MemoryError::ForeignPointer {
                address,
                owner: "segregated pools",
            }),
        }
    }

    pub fn owns(&self, address: Address) -> bool {
        self.classes.iter().any(|pool| pool.owns(address))
    }

    /// Slot size that would serve a request
    pub fn class_size_for(&self, size: Size, align: usize) -> Option<Size> {
        size_class_index(size, align).map(|index| SIZE_CLASSES[index])
    }

    /// Statistics per class, smallest first
    pub fn class_stats(&self) -> Vec<PoolStats> {
        self.classes.iter().map(Pool::stats).collect()
    }

    pub fn try_shrink(&self) -> Size {
        self.classes.iter().map(DynamicPool::try_shrink).sum()
    }
}

impl BlockAllocator for SegregatedPools {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        SegregatedPools::allocate(self, size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        SegregatedPools::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        SegregatedPools::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        self.classes.iter().fold(AllocatorUsage::default(), |mut usage, pool| {
            let stats = Pool::stats(pool);
            usage.capacity += pool.reserved_bytes();
            usage.used += stats.used * stats.slot_size;
            usage.live_blocks += stats.used;
            usage
        })
    }
}
