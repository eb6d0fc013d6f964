/*!
 * Custom Pools
 * Caller-registered pools addressed by name
 */

use super::dispatch::secure_wipe;
use super::MemoryManager;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::types::{Address, Size};
use crate::memory::tracker::AllocationRecord;
use crate::memory::traits::Pool;
use crate::memory::types::{AllocatorKind, MemoryPolicy, PoolStats};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl MemoryManager {
    /// Register `pool` under `name`; names are unique
    pub fn register_custom_pool(&self, name: &str, pool: Arc<dyn Pool>) -> MemoryResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.custom_pools.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(MemoryError::PoolAlreadyRegistered(name.to_owned())),
            Entry::Vacant(slot) => {
                let slot_size = pool.slot_size();
                slot.insert(pool);
                info!(pool = name, slot_size, "Registered custom pool");
                Ok(())
            }
        }
    }

    /// Remove a pool. Blocks still out keep pointing into it; the returned
    /// handle keeps its storage alive.
    pub fn unregister_custom_pool(&self, name: &str) -> Option<Arc<dyn Pool>> {
        let (_, pool) = self.custom_pools.remove(name)?;
        let live = pool.stats().used;
        if live > 0 {
            warn!(pool = name, live, "Unregistered custom pool with live blocks");
        } else {
            debug!(pool = name, "Unregistered custom pool");
        }
        Some(pool)
    }

    pub fn custom_pool(&self, name: &str) -> Option<Arc<dyn Pool>> {
        self.custom_pools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Allocate one slot from the named pool.
    ///
    /// `None` for an unknown pool, an exhausted pool, or a request larger
    /// (or more aligned) than the pool's slots. Callers typically fall back
    /// to `allocate`. Metrics charge the whole slot, tracked or not.
    pub fn allocate_from_pool(
        &self,
        name: &str,
        size: Size,
        policy: &MemoryPolicy,
    ) -> Option<NonNull<u8>> {
        let Some(pool) = self.custom_pool(name) else {
            warn!(pool = name, "Allocation from unknown pool");
            self.counters.record_failure();
            return None;
        };
        if size > pool.slot_size() || policy.alignment > pool.slot_align() {
            debug!(
                pool = name,
                size,
                slot_size = pool.slot_size(),
                "Request does not fit pool slots"
            );
            self.counters.record_failure();
            return None;
        }
        let charge = pool.slot_size();
        if let Some(limit) = self.config.hard_limit {
            if self.counters.current().saturating_add(charge) > limit {
                self.counters.record_failure();
                return None;
            }
        }

        let Some(ptr) = pool.allocate() else {
            debug!(pool = name, "Custom pool exhausted");
            self.counters.record_failure();
            return None;
        };

        if policy.enable_tracking {
            let record = AllocationRecord::new(
                ptr.as_ptr() as Address,
                size,
                pool.slot_align(),
                policy,
                AllocatorKind::CustomPool,
            )
            .with_pool(name);
            self.tracker.track(record);
        }
        let current = self.counters.record_allocation(charge, None);
        self.update_pressure(current);
        Some(ptr)
    }

    /// Return a slot to the named pool
    pub fn deallocate_to_pool(&self, name: &str, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        let pool = self.custom_pool(name).ok_or_else(|| {
            warn!(pool = name, "Deallocation to unknown pool");
            MemoryError::UnknownPool(name.to_owned())
        })?;
        if !pool.owns(address) {
            self.tracker.record_invalid_free(address);
            return Err(MemoryError::ForeignPointer {
                address,
                owner: "custom pool",
            });
        }

        let record = self.tracker.take(address);
        if let Some(record) = record.as_ref().filter(|record| record.sensitive) {
            // SAFETY: the slot is live and at least `record.size` bytes long
            unsafe { secure_wipe(ptr, record.size) };
        }
        if let Err(err) = pool.deallocate(ptr) {
            self.note_release_error(address, &err);
            return Err(err);
        }

        let current = self.counters.record_deallocation(pool.slot_size());
        self.update_pressure(current);
        Ok(())
    }

    /// Hand `ptr` back to the pool registered as `name`, returning the
    /// slot size charged for it; accounting is the caller's job
    pub(super) fn release_to_pool(&self, name: &str, ptr: NonNull<u8>) -> MemoryResult<Size> {
        let pool = self
            .custom_pool(name)
            .ok_or_else(|| MemoryError::UnknownPool(name.to_owned()))?;
        pool.deallocate(ptr)?;
        Ok(pool.slot_size())
    }

    /// Name of the registered pool whose storage holds `address`
    pub(super) fn custom_pool_owning(&self, address: Address) -> Option<String> {
        self.custom_pool_snapshot()
            .into_iter()
            .find(|(_, pool)| pool.owns(address))
            .map(|(name, _)| name)
    }

    pub fn custom_pool_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<_> = self
            .custom_pool_snapshot()
            .into_iter()
            .map(|(name, pool)| (name, pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub(super) fn shrink_custom_pools(&self) -> Size {
        self.custom_pool_snapshot()
            .iter()
            .map(|(_, pool)| pool.try_shrink())
            .sum()
    }

    /// Pools are user code; never call into them under a map guard
    fn custom_pool_snapshot(&self) -> Vec<(String, Arc<dyn Pool>)> {
        self.custom_pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}
