/*!
 * Allocation Dispatch
 * Strategy chains, release routing and pressure relief
 */

use super::MemoryManager;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{
    DEFAULT_ALIGNMENT, LOCKFREE_BLOCK_SIZE, MAX_SIZE_CLASS, THREAD_CACHE_MAX_OBJECT,
};
use crate::core::types::{Address, Size};
use crate::memory::allocators::size_class_index;
use crate::memory::tracker::AllocationRecord;
use crate::memory::types::{AllocationStrategy, AllocatorKind, MemoryPolicy, PressureLevel};
use std::ptr::NonNull;
use std::sync::atomic::{self, Ordering};
use tracing::{debug, warn};

/// Address of the shared zero-length token handed out for size 0
pub const ZERO_SIZE_ADDRESS: Address = DEFAULT_ALIGNMENT;

const FASTEST: &[AllocatorKind] = &[
    AllocatorKind::LockFree,
    AllocatorKind::Linear,
    AllocatorKind::Heap,
];
const SEGREGATED: &[AllocatorKind] = &[AllocatorKind::Segregated, AllocatorKind::Heap];
const THREAD_LOCAL: &[AllocatorKind] = &[AllocatorKind::ThreadLocal, AllocatorKind::Heap];
const NUMA_AWARE: &[AllocatorKind] = &[AllocatorKind::Numa, AllocatorKind::Heap];
const HEAP_ONLY: &[AllocatorKind] = &[AllocatorKind::Heap];
const HEAP_FIRST: &[AllocatorKind] = &[AllocatorKind::Heap, AllocatorKind::Segregated];

pub(super) fn zero_size_token() -> Option<NonNull<u8>> {
    NonNull::new(ZERO_SIZE_ADDRESS as *mut u8)
}

/// Allocators tried for `strategy`, in order
pub(super) fn chain_for(
    strategy: AllocationStrategy,
    size: Size,
    pressure: PressureLevel,
) -> &'static [AllocatorKind] {
    match strategy {
        AllocationStrategy::Fastest => FASTEST,
        AllocationStrategy::MostEfficient | AllocationStrategy::SizeSegregated => SEGREGATED,
        AllocationStrategy::ThreadLocal => THREAD_LOCAL,
        AllocationStrategy::NumaAware => NUMA_AWARE,
        AllocationStrategy::Balanced if pressure >= PressureLevel::High => HEAP_FIRST,
        AllocationStrategy::Balanced if size <= MAX_SIZE_CLASS => SEGREGATED,
        AllocationStrategy::Balanced => HEAP_ONLY,
    }
}

/// Whether `kind` can serve this request shape at all
fn accepts(kind: AllocatorKind, size: Size, align: usize) -> bool {
    match kind {
        AllocatorKind::LockFree => size <= LOCKFREE_BLOCK_SIZE && align <= LOCKFREE_BLOCK_SIZE,
        AllocatorKind::Segregated => size_class_index(size, align).is_some(),
        AllocatorKind::ThreadLocal => {
            size <= THREAD_CACHE_MAX_OBJECT && size_class_index(size, align).is_some()
        }
        AllocatorKind::CustomPool => false,
        _ => true,
    }
}

impl MemoryManager {
    /// Allocate `size` bytes under `policy`.
    ///
    /// Returns `None` when every allocator in the strategy's chain is
    /// exhausted; this is counted, never a panic.
    pub fn allocate(&self, size: Size, policy: &MemoryPolicy) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT, policy)
    }

    /// Allocate with at least `align` alignment (`policy.alignment` also applies)
    pub fn allocate_aligned(
        &self,
        size: Size,
        align: usize,
        policy: &MemoryPolicy,
    ) -> Option<NonNull<u8>> {
        let align = align.max(policy.alignment);
        if !align.is_power_of_two() {
            warn!(
                align,
                tag = %policy.allocation_tag,
                "Rejected allocation with invalid alignment"
            );
            self.counters.record_failure();
            return None;
        }
        if size == 0 {
            self.counters
                .zero_size_allocations
                .fetch_add(1, Ordering::Relaxed);
            return zero_size_token();
        }
        if let Some(limit) = self.config.hard_limit {
            if self.counters.current().saturating_add(size) > limit {
                self.counters.record_failure();
                debug!(size, limit, "Allocation refused by hard limit");
                return None;
            }
        }

        let Some((ptr, kind, fell_back)) = self.dispatch(size, align, policy.strategy) else {
            self.counters.record_failure();
            debug!(size, align, strategy = %policy.strategy, "Allocation failed");
            return None;
        };

        if fell_back {
            self.counters
                .fallback_allocations
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                size,
                strategy = %policy.strategy,
                served_by = kind.as_str(),
                "Allocation fell back"
            );
        }
        if policy.enable_tracking {
            self.tracker.track(AllocationRecord::new(
                ptr.as_ptr() as Address,
                size,
                align,
                policy,
                kind,
            ));
        }
        let current = self.counters.record_allocation(size, Some(policy.strategy));
        self.update_pressure(current);
        Some(ptr)
    }

    /// Walk the chain for `strategy`; returns the block, who served it and
    /// whether an earlier eligible allocator missed
    fn dispatch(
        &self,
        size: Size,
        align: usize,
        strategy: AllocationStrategy,
    ) -> Option<(NonNull<u8>, AllocatorKind, bool)> {
        let chain = chain_for(strategy, size, self.pressure.level());
        let mut missed = false;
        for &kind in chain {
            if !accepts(kind, size, align) {
                continue;
            }
            if let Some(ptr) = self.allocate_from(kind, size, align) {
                return Some((ptr, kind, missed));
            }
            missed = true;
        }

        if self.config.allow_system_fallback {
            return self
                .system
                .allocate(size, align)
                .map(|ptr| (ptr, AllocatorKind::System, true));
        }
        None
    }

    fn allocate_from(&self, kind: AllocatorKind, size: Size, align: usize) -> Option<NonNull<u8>> {
        match kind {
            AllocatorKind::LockFree => self.lockfree.allocate(),
            AllocatorKind::Linear => self.linear.allocate_aligned(size, align),
            AllocatorKind::Segregated => self.segregated.allocate(size, align),
            AllocatorKind::ThreadLocal => self.thread_local.allocate(size, align),
            AllocatorKind::Numa => self.numa.allocate(size, align),
            AllocatorKind::Heap => self.heap.allocate(size, align),
            AllocatorKind::System => self.system.allocate(size, align),
            AllocatorKind::CustomPool => None,
        }
    }

    /// Release a block of `size` bytes (0 if unknown).
    ///
    /// With tracking enabled, a second free of the same block is reported as
    /// `DoubleFree` without touching any allocator. A pointer no allocator
    /// owns fails with `ForeignPointer`. Both count as corruption.
    pub fn deallocate(
        &self,
        ptr: NonNull<u8>,
        size: Size,
        policy: &MemoryPolicy,
    ) -> MemoryResult<()> {
        self.release(ptr, size, policy.enable_tracking)
    }

    /// Release a block whose size the tracker knows.
    ///
    /// Untracked blocks are left alone and reported as `SizeUnknown`.
    pub fn deallocate_unsized(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        if address == ZERO_SIZE_ADDRESS {
            return Ok(());
        }
        match self.tracker.size_of(address) {
            Some(size) => self.release(ptr, size, true),
            None => {
                warn!(
                    address = format_args!("0x{:x}", address),
                    "Cannot infer size of untracked block"
                );
                Err(MemoryError::SizeUnknown(address))
            }
        }
    }

    /// Fail early for a block that cannot be released, without side effects
    /// beyond corruption accounting
    pub(super) fn verify_releasable(
        &self,
        address: Address,
        check_retired: bool,
    ) -> MemoryResult<()> {
        if address == ZERO_SIZE_ADDRESS || self.tracker.is_tracked(address) {
            return Ok(());
        }
        if check_retired && self.tracker.is_retired(address) {
            self.tracker.record_double_free(address);
            return Err(MemoryError::DoubleFree(address));
        }
        if self.owner_of(address).is_none() && self.custom_pool_owning(address).is_none() {
            self.tracker.record_invalid_free(address);
            return Err(MemoryError::ForeignPointer {
                address,
                owner: "memory manager",
            });
        }
        Ok(())
    }

    pub(super) fn release(
        &self,
        ptr: NonNull<u8>,
        size: Size,
        check_retired: bool,
    ) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        if address == ZERO_SIZE_ADDRESS {
            return Ok(());
        }

        let record = self.tracker.take(address);
        if record.is_none() {
            self.verify_releasable(address, check_retired)?;
        }

        let (kind, pool) = match &record {
            Some(record) => (record.source, record.pool.as_ref().map(|p| p.to_string())),
            None => match self.owner_of(address) {
                Some(kind) => (kind, None),
                None => (AllocatorKind::CustomPool, self.custom_pool_owning(address)),
            },
        };
        let requested = record.as_ref().map_or(size, |record| record.size);

        // Only tracked blocks have a trusted extent to wipe
        if record.as_ref().map_or(false, |record| record.sensitive) {
            // SAFETY: the block is live and was allocated with `requested` bytes
            unsafe { secure_wipe(ptr, requested) };
        }

        // Pool slots are charged at slot size, everything else as requested
        let result = match kind {
            AllocatorKind::CustomPool => match pool {
                Some(name) => self.release_to_pool(&name, ptr),
                None => Err(MemoryError::ForeignPointer {
                    address,
                    owner: "memory manager",
                }),
            },
            kind => match self.allocator(kind) {
                Some(allocator) => allocator.deallocate(ptr).map(|()| requested),
                None => Err(MemoryError::InvalidFree(address)),
            },
        };

        let freed_size = match result {
            Ok(freed_size) => freed_size,
            Err(err) => {
                self.note_release_error(address, &err);
                return Err(err);
            }
        };

        let current = self.counters.record_deallocation(freed_size);
        self.update_pressure(current);
        Ok(())
    }

    /// Count an allocator-side rejection as corruption
    pub(super) fn note_release_error(&self, address: Address, err: &MemoryError) {
        match err {
            MemoryError::DoubleFree(_) => self.tracker.record_double_free(address),
            _ => self.tracker.record_invalid_free(address),
        }
    }

    /// Feed live bytes to the detector and relieve pressure on a rise
    pub(super) fn update_pressure(&self, current: Size) {
        let Some(change) = self.pressure.update(current) else {
            return;
        };
        if change.is_escalation() && self.default_policy.load().enable_automatic_cleanup {
            let freed = self.relieve(change.current);
            debug!(level = %change.current, freed, "Pressure relief");
        }
    }

    /// Release cached memory proportionally to `level`, returning bytes freed
    pub(super) fn relieve(&self, level: PressureLevel) -> Size {
        let mut freed = 0;
        if level >= PressureLevel::Moderate {
            freed += self.segregated.try_shrink();
        }
        if level >= PressureLevel::High {
            freed += self.thread_local.collect_unused_caches();
            self.heap.coalesce();
            self.numa.coalesce();
            freed += self.shrink_custom_pools();
        }
        if level >= PressureLevel::Critical && self.linear.rewind_if_idle() {
            debug!("Rewound idle linear arena");
        }
        freed
    }
}

/// Zero `len` bytes in a way the optimizer cannot elide
///
/// # Safety
/// `ptr` must be valid for writes of `len` bytes.
pub(super) unsafe fn secure_wipe(ptr: NonNull<u8>, len: Size) {
    let base = ptr.as_ptr();
    for offset in 0..len {
        std::ptr::write_volatile(base.add(offset), 0);
    }
    atomic::compiler_fence(Ordering::SeqCst);
}
