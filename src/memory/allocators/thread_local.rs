/*!
 * Thread-Local Allocator
 * Per-thread size-class caches with lock-free remote frees
 *
 * Each thread lazily receives a private region split into pages; a page is
 * dedicated to one small size class on first use. The owning thread
 * allocates and frees without any synchronization beyond relaxed counters.
 * Blocks freed by other threads are pushed onto the cache's remote queue
 * and folded back into the owner's free lists on the next miss.
 */

use super::region::Region;
use super::segregated::size_class_index;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{SIZE_CLASSES, THREAD_CACHE_MAX_OBJECT, THREAD_CACHE_PAGE_SIZE};
use crate::core::types::{Address, Size};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

/// Size classes served from thread caches: every class up to the max object
const CLASS_COUNT: usize = 8;
const UNASSIGNED: u8 = u8::MAX;
const GRANULE: usize = 16;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Part of a thread cache visible to every thread
struct SharedCache {
    region: Region,
    owner: ThreadId,
    owner_alive: AtomicBool,
    /// Size class index per page, `UNASSIGNED` until carved
    page_classes: Box<[AtomicU8]>,
    /// One bit per 16-byte granule, set at the start of each live block
    live_bits: Box<[AtomicU64]>,
    remote_frees: ArrayQueue<u32>,
    live: AtomicUsize,
    used: AtomicUsize,
}

impl SharedCache {
    fn new(capacity: Size, owner: ThreadId) -> MemoryResult<Self> {
        let region = Region::new(capacity)?;
        let pages = capacity / THREAD_CACHE_PAGE_SIZE;
        let granules = capacity / GRANULE;
        Ok(Self {
            region,
            owner,
            owner_alive: AtomicBool::new(true),
            page_classes: (0..pages).map(|_| AtomicU8::new(UNASSIGNED)).collect(),
            live_bits: (0..granules.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            // Every block could be freed remotely at once; the queue never fills
            remote_frees: ArrayQueue::new(granules),
            live: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn mark_live(&self, offset: usize, class_size: Size) {
        let granule = offset / GRANULE;
        self.live_bits[granule / 64].fetch_or(1 << (granule % 64), Ordering::AcqRel);
        self.live.fetch_add(1, Ordering::Relaxed);
        self.used.fetch_add(class_size, Ordering::Relaxed);
    }

    /// Validate and clear the live bit of a block; returns its class index
    fn release(&self, address: Address) -> MemoryResult<usize> {
        let offset = self
            .region
            .offset_of(address)
            .ok_or(MemoryError::ForeignPointer {
                address,
                owner: "thread-local allocator",
            })?;
        let page = offset / THREAD_CACHE_PAGE_SIZE;
        let class = self.page_classes[page].load(Ordering::Acquire);
        if class == UNASSIGNED {
            return Err(MemoryError::InvalidFree(address));
        }
        let class = class as usize;
        let class_size = SIZE_CLASSES[class];
        if (offset - page * THREAD_CACHE_PAGE_SIZE) % class_size != 0 {
            return Err(MemoryError::InvalidFree(address));
        }

        let granule = offset / GRANULE;
        let bit = 1 << (granule % 64);
        if self.live_bits[granule / 64].fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            return Err(MemoryError::DoubleFree(address));
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.used.fetch_sub(class_size, Ordering::Relaxed);
        Ok(class)
    }
}

/// Owner-only part of a thread cache
struct LocalCache {
    allocator_id: u64,
    allocator: Weak<()>,
    shared: Arc<SharedCache>,
    free_lists: [Vec<u32>; CLASS_COUNT],
    /// (next offset, page end) of the page currently carved per class
    carving: [Option<(usize, usize)>; CLASS_COUNT],
    next_page: usize,
}

impl LocalCache {
    fn allocate(&mut self, class: usize) -> Option<NonNull<u8>> {
        let offset = self.take_block(class).or_else(|| {
            self.drain_remote();
            self.free_lists[class].pop().map(|o| o as usize)
        })?;
        self.shared.mark_live(offset, SIZE_CLASSES[class]);
        Some(self.shared.region.ptr_at(offset))
    }

    fn take_block(&mut self, class: usize) -> Option<usize> {
        if let Some(offset) = self.free_lists[class].pop() {
            return Some(offset as usize);
        }

        let class_size = SIZE_CLASSES[class];
        if let Some((next, end)) = self.carving[class] {
            if next + class_size <= end {
                self.carving[class] = Some((next + class_size, end));
                return Some(next);
            }
        }

        // Carve a fresh page for this class
        if self.next_page >= self.shared.page_classes.len() {
            return None;
        }
        let page = self.next_page;
        self.next_page += 1;
        self.shared.page_classes[page].store(class as u8, Ordering::Release);
        let start = page * THREAD_CACHE_PAGE_SIZE;
        self.carving[class] = Some((start + class_size, start + THREAD_CACHE_PAGE_SIZE));
        Some(start)
    }

    fn drain_remote(&mut self) {
        while let Some(offset) = self.shared.remote_frees.pop() {
            let page = offset as usize / THREAD_CACHE_PAGE_SIZE;
            let class = self.shared.page_classes[page].load(Ordering::Acquire) as usize;
            self.free_lists[class].push(offset);
        }
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.shared.owner_alive.store(false, Ordering::Release);
    }
}

thread_local! {
    static LOCAL_CACHES: RefCell<Vec<LocalCache>> = const { RefCell::new(Vec::new()) };
}

/// Allocator handing every thread its own cache.
///
/// Requests above `THREAD_CACHE_MAX_OBJECT` or a full cache return `None`;
/// the manager then falls back to the shared heap.
pub struct ThreadLocalAllocator {
    id: u64,
    alive: Arc<()>,
    cache_capacity: Size,
    caches: RwLock<Vec<Arc<SharedCache>>>,
    remote_frees: AtomicU64,
    reclaimed_caches: AtomicU64,
}

impl ThreadLocalAllocator {
    pub fn new(cache_capacity: Size) -> MemoryResult<Self> {
        if cache_capacity < THREAD_CACHE_PAGE_SIZE {
            return Err(MemoryError::InvalidConfig(format!(
                "thread cache capacity must be at least {THREAD_CACHE_PAGE_SIZE} bytes"
            )));
        }
        if cache_capacity > u32::MAX as usize {
            return Err(MemoryError::InvalidConfig(
                "thread cache capacity must fit in 32-bit offsets".into(),
            ));
        }
        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            cache_capacity,
            caches: RwLock::new(Vec::new()),
            remote_frees: AtomicU64::new(0),
            reclaimed_caches: AtomicU64::new(0),
        })
    }

    /// Run `f` on the calling thread's cache, creating it on first use when
    /// `create` is set. Returns `None` while thread-local storage is being
    /// torn down.
    fn with_local<R>(&self, create: bool, f: impl FnOnce(&mut LocalCache) -> R) -> Option<R> {
        LOCAL_CACHES
            .try_with(|caches| {
                let mut caches = caches.try_borrow_mut().ok()?;
                let index = match caches.iter().position(|c| c.allocator_id == self.id) {
                    Some(index) => index,
                    None if !create => return None,
                    None => {
                        // Drop caches of allocators that no longer exist
                        caches.retain(|c| c.allocator.strong_count() > 0);
                        caches.push(self.create_cache()?);
                        caches.len() - 1
                    }
                };
                Some(f(&mut caches[index]))
            })
            .ok()
            .flatten()
    }

    fn create_cache(&self) -> Option<LocalCache> {
        let owner = thread::current().id();
        let shared = Arc::new(SharedCache::new(self.cache_capacity, owner).ok()?);
        self.caches.write().push(Arc::clone(&shared));
        debug!(
            thread = ?owner,
            capacity = self.cache_capacity,
            "Thread cache created"
        );
        Some(LocalCache {
            allocator_id: self.id,
            allocator: Arc::downgrade(&self.alive),
            shared,
            free_lists: Default::default(),
            carving: [None; CLASS_COUNT],
            next_page: 0,
        })
    }

    pub fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        if size > THREAD_CACHE_MAX_OBJECT {
            return None;
        }
        let class = size_class_index(size, align).filter(|&class| class < CLASS_COUNT)?;
        self.with_local(true, |local| local.allocate(class)).flatten()
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;

        // Owner fast path: no shared locks
        let local = self.with_local(false, |local| {
            if !local.shared.region.contains(address) {
                return None;
            }
            Some(local.shared.release(address).map(|class| {
                let offset = address - local.shared.region.base();
                local.free_lists[class].push(offset as u32);
            }))
        });
        if let Some(Some(result)) = local {
            return result;
        }

        let caches = self.caches.read();
        let shared = caches
            .iter()
            .find(|cache| cache.region.contains(address))
            .ok_or(MemoryError::ForeignPointer {
                address,
                owner: "thread-local allocator",
            })?;
        shared.release(address)?;
        let offset = (address - shared.region.base()) as u32;
        if shared.remote_frees.push(offset).is_err() {
            debug_assert!(false, "remote free queue overflow");
        }
        drop(caches);

        self.remote_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn owns(&self, address: Address) -> bool {
        self.caches
            .read()
            .iter()
            .any(|cache| cache.region.contains(address))
    }

    /// Release caches whose thread exited and whose blocks were all freed.
    /// Returns the bytes returned to the system.
    pub fn collect_unused_caches(&self) -> Size {
        let mut caches = self.caches.write();
        let before = caches.len();
        let mut freed = 0;
        caches.retain(|cache| {
            let unused = !cache.owner_alive.load(Ordering::Acquire)
                && cache.live.load(Ordering::Acquire) == 0;
            if unused {
                freed += cache.region.capacity();
            }
            !unused
        });
        let reclaimed = before - caches.len();
        drop(caches);

        if reclaimed > 0 {
            self.reclaimed_caches
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            debug!(reclaimed, freed, "Collected unused thread caches");
        }
        freed
    }

    pub fn cache_count(&self) -> usize {
        self.caches.read().len()
    }

    pub fn remote_free_count(&self) -> u64 {
        self.remote_frees.load(Ordering::Relaxed)
    }

    /// Whether the calling thread owns a cache in this allocator
    pub fn has_local_cache(&self) -> bool {
        let me = thread::current().id();
        self.caches.read().iter().any(|cache| cache.owner == me)
    }
}

impl BlockAllocator for ThreadLocalAllocator {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        ThreadLocalAllocator::allocate(self, size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        ThreadLocalAllocator::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        ThreadLocalAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        self.caches
            .read()
            .iter()
            .fold(AllocatorUsage::default(), |mut usage, cache| {
                usage.capacity += cache.region.capacity();
                usage.used += cache.used.load(Ordering::Relaxed);
                usage.live_blocks += cache.live.load(Ordering::Relaxed);
                usage
            })
    }
}
