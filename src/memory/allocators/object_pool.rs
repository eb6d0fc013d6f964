/*!
 * Object Pools
 * Fixed-capacity slot pools with an intrusive free list
 */

use super::region::Region;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::types::{align_up, Address, Size};
use crate::memory::traits::Pool;
use crate::memory::types::PoolStats;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

const NO_SLOT: usize = usize::MAX;

#[derive(Debug)]
struct SlabState {
    /// Head of the intrusive free list; each free slot stores the next index
    free_head: usize,
    /// Slots past this index have never been handed out
    bump: usize,
    /// One bit per slot, set while the slot is live
    live: Vec<u64>,
    used: usize,
}

impl SlabState {
    #[inline]
    fn is_live(&self, index: usize) -> bool {
        self.live[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set_live(&mut self, index: usize, live: bool) {
        let word = &mut self.live[index / 64];
        if live {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }
}

/// Untyped pool of `capacity` equally sized slots in one region.
///
/// Slots are threaded lazily: fresh slots come from a bump index, released
/// slots go on an intrusive list stored in the slots themselves. A live
/// bitmap rejects double frees and interior pointers in every build.
pub struct SlabPool {
    region: Region,
    stride: Size,
    align: usize,
    capacity: usize,
    state: Mutex<SlabState>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    failed: AtomicU64,
}

impl SlabPool {
    /// `slot_size` bytes per slot aligned to `slot_align`
    pub fn new(slot_size: Size, slot_align: usize, capacity: usize) -> MemoryResult<Self> {
        if !slot_align.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(slot_align));
        }
        if capacity == 0 {
            return Err(MemoryError::InvalidConfig(
                "pool capacity must be non-zero".into(),
            ));
        }
        let align = slot_align.max(mem::align_of::<usize>());
        let stride = align_up(slot_size.max(mem::size_of::<usize>()), align);
        let bytes = stride.checked_mul(capacity).ok_or_else(|| {
            MemoryError::InvalidConfig(format!("pool of {capacity} x {stride} bytes overflows"))
        })?;

        Ok(Self {
            region: Region::with_alignment(bytes, align)?,
            stride,
            align,
            capacity,
            state: Mutex::new(SlabState {
                free_head: NO_SLOT,
                bump: 0,
                live: vec![0; capacity.div_ceil(64)],
                used: 0,
            }),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        let index = if state.free_head != NO_SLOT {
            let index = state.free_head;
            // SAFETY: free slots hold the next index in their first word and
            // the stride keeps every slot usize-aligned
            state.free_head = unsafe { self.slot_ptr(index).cast::<usize>().as_ptr().read() };
            index
        } else if state.bump < self.capacity {
            state.bump += 1;
            state.bump - 1
        } else {
            drop(state);
            self.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        debug_assert!(!state.is_live(index), "free list yielded live slot {index}");
        state.set_live(index, true);
        state.used += 1;
        drop(state);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(self.slot_ptr(index))
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let index = self.slot_index(address)?;

        let mut state = self.state.lock();
        if !state.is_live(index) {
            return Err(MemoryError::DoubleFree(address));
        }
        state.set_live(index, false);
        // SAFETY: the slot is owned by the pool again and usize-aligned
        unsafe { ptr.cast::<usize>().as_ptr().write(state.free_head) };
        state.free_head = index;
        state.used -= 1;
        drop(state);

        self.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validate that `address` is the start of a live slot
    pub fn check_live(&self, address: Address) -> MemoryResult<()> {
        let index = self.slot_index(address)?;
        if self.state.lock().is_live(index) {
            Ok(())
        } else {
            Err(MemoryError::DoubleFree(address))
        }
    }

    fn slot_index(&self, address: Address) -> MemoryResult<usize> {
        match self.region.offset_of(address) {
            Some(offset) if offset % self.stride == 0 && offset / self.stride < self.capacity => {
                Ok(offset / self.stride)
            }
            Some(_) => Err(MemoryError::InvalidFree(address)),
            None => Err(MemoryError::ForeignPointer {
                address,
                owner: "object pool",
            }),
        }
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        self.region.ptr_at(index * self.stride)
    }

    #[inline]
    pub fn owns(&self, address: Address) -> bool {
        self.region.contains(address)
    }

    pub fn stride(&self) -> Size {
        self.stride
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn is_full(&self) -> bool {
        self.used() == self.capacity
    }

    /// Bytes of backing storage
    pub fn reserved_bytes(&self) -> Size {
        self.region.capacity()
    }
}

impl Pool for SlabPool {
    fn slot_size(&self) -> Size {
        self.stride
    }

    fn slot_align(&self) -> usize {
        self.align
    }

    fn allocate(&self) -> Option<NonNull<u8>> {
        SlabPool::allocate(self)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        SlabPool::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        SlabPool::owns(self, address)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            slot_size: self.stride,
            capacity: self.capacity,
            used: self.used(),
            chunks: 1,
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            failed_allocations: self.failed.load(Ordering::Relaxed),
            grow_events: 0,
            shrink_events: 0,
        }
    }
}

impl std::fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPool")
            .field("stride", &self.stride)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

/// Fixed-capacity pool of `T` slots
pub struct ObjectPool<T> {
    slab: SlabPool,
    _marker: PhantomData<T>,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize) -> MemoryResult<Self> {
        Ok(Self {
            slab: SlabPool::new(mem::size_of::<T>(), mem::align_of::<T>(), capacity)?,
            _marker: PhantomData,
        })
    }

    /// Pop an uninitialized slot, `None` when the pool is full
    pub fn allocate(&self) -> Option<NonNull<MaybeUninit<T>>> {
        self.slab.allocate().map(NonNull::cast)
    }

    /// Allocate a slot and move `value` into it
    pub fn create(&self, value: T) -> Option<NonNull<T>> {
        let slot = self.allocate()?;
        // SAFETY: the slot is sized and aligned for T and exclusively ours
        unsafe { slot.as_ptr().write(MaybeUninit::new(value)) };
        Some(slot.cast())
    }

    /// Return a slot without running `T`'s destructor
    pub fn deallocate(&self, ptr: NonNull<T>) -> MemoryResult<()> {
        self.slab.deallocate(ptr.cast())
    }

    /// Drop the value in place and return its slot.
    ///
    /// The pointer is validated before the destructor runs.
    ///
    /// # Safety
    /// `ptr` must hold an initialized `T` created by this pool that no one
    /// else will access afterwards.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) -> MemoryResult<()> {
        self.slab.check_live(ptr.as_ptr() as Address)?;
        std::ptr::drop_in_place(ptr.as_ptr());
        self.slab.deallocate(ptr.cast())
    }

    pub fn owns(&self, ptr: NonNull<T>) -> bool {
        self.slab.owns(ptr.as_ptr() as Address)
    }

    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    pub fn used(&self) -> usize {
        self.slab.used()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn stats(&self) -> PoolStats {
        Pool::stats(&self.slab)
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("type", &std::any::type_name::<T>())
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}
