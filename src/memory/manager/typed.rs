/*!
 * Typed Allocation
 *
 * Object and array helpers over raw allocation. Construction is
 * unwind-safe: if a constructor panics or fails, the already built elements
 * are dropped in reverse order and the raw block is released before the
 * failure propagates.
 */

use super::MemoryManager;
use crate::core::errors::{ConstructError, MemoryResult};
use crate::core::types::{Address, Size};
use crate::memory::types::MemoryPolicy;
use std::alloc::Layout;
use std::convert::Infallible;
use std::mem;
use std::ptr::{self, NonNull};

/// Releases a raw block on drop unless disarmed
pub(super) struct BlockGuard<'a> {
    manager: &'a MemoryManager,
    policy: &'a MemoryPolicy,
    ptr: NonNull<u8>,
    size: Size,
    armed: bool,
}

impl<'a> BlockGuard<'a> {
    pub(super) fn new(
        manager: &'a MemoryManager,
        policy: &'a MemoryPolicy,
        ptr: NonNull<u8>,
        size: Size,
    ) -> Self {
        Self {
            manager,
            policy,
            ptr,
            size,
            armed: true,
        }
    }

    /// Keep the block
    pub(super) fn disarm(mut self) {
        self.armed = false;
    }

    /// Free the block now and report the outcome
    pub(super) fn release(mut self) -> MemoryResult<()> {
        self.armed = false;
        self.manager.deallocate(self.ptr, self.size, self.policy)
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.manager.deallocate(self.ptr, self.size, self.policy);
        }
    }
}

/// Drops the first `initialized` elements, last first, unless disarmed
struct ElementsGuard<T> {
    base: NonNull<T>,
    initialized: usize,
}

impl<T> Drop for ElementsGuard<T> {
    fn drop(&mut self) {
        for index in (0..self.initialized).rev() {
            // SAFETY: elements below `initialized` were written and not moved out
            unsafe { ptr::drop_in_place(self.base.as_ptr().add(index)) };
        }
    }
}

impl MemoryManager {
    /// Allocate and construct a `T` under `policy`.
    ///
    /// Returns `None` if no allocator can provide the block. If `ctor`
    /// panics, the block is released before the panic continues.
    pub fn allocate_object<T>(
        &self,
        policy: &MemoryPolicy,
        ctor: impl FnOnce() -> T,
    ) -> Option<NonNull<T>> {
        self.try_allocate_object(policy, || Ok::<T, Infallible>(ctor()))
            .ok()
    }

    /// Fallible construction; on `Err` the raw block is already released
    pub fn try_allocate_object<T, E>(
        &self,
        policy: &MemoryPolicy,
        ctor: impl FnOnce() -> Result<T, E>,
    ) -> Result<NonNull<T>, ConstructError<E>> {
        if mem::size_of::<T>() == 0 {
            let ptr = NonNull::<T>::dangling();
            let value = ctor().map_err(ConstructError::Constructor)?;
            // SAFETY: zero-sized writes through a dangling, aligned pointer are valid
            unsafe { ptr.as_ptr().write(value) };
            return Ok(ptr);
        }

        let layout = Layout::new::<T>();
        let raw = self
            .allocate_aligned(layout.size(), layout.align(), policy)
            .ok_or(ConstructError::AllocationFailed)?;
        let guard = BlockGuard::new(self, policy, raw, layout.size());

        let value = ctor().map_err(ConstructError::Constructor)?;
        let ptr = raw.cast::<T>();
        // SAFETY: `raw` is a fresh block sized and aligned for `T`
        unsafe { ptr.as_ptr().write(value) };
        guard.disarm();
        Ok(ptr)
    }

    /// Drop the object in place and release its block.
    ///
    /// The block is released even if `T`'s destructor panics. A pointer
    /// that cannot be released (double free, foreign pointer) is rejected
    /// before the destructor runs.
    ///
    /// # Safety
    /// `ptr` must come from `allocate_object::<T>` on this manager, with an
    /// equivalent policy, and must not be used afterwards.
    pub unsafe fn deallocate_object<T>(
        &self,
        ptr: NonNull<T>,
        policy: &MemoryPolicy,
    ) -> MemoryResult<()> {
        if mem::size_of::<T>() == 0 {
            ptr::drop_in_place(ptr.as_ptr());
            return Ok(());
        }

        self.verify_releasable(ptr.as_ptr() as Address, policy.enable_tracking)?;
        let guard = BlockGuard::new(self, policy, ptr.cast(), mem::size_of::<T>());
        ptr::drop_in_place(ptr.as_ptr());
        guard.release()
    }

    /// Allocate `count` elements built by `init(index)`, in index order.
    ///
    /// `count == 0` or a zero-sized `T` needs no block and yields a
    /// dangling pointer.
    pub fn allocate_array<T>(
        &self,
        count: usize,
        policy: &MemoryPolicy,
        mut init: impl FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        self.try_allocate_array(count, policy, |index| Ok::<T, Infallible>(init(index)))
            .ok()
    }

    /// Fallible element construction; on `Err` the elements built so far are
    /// dropped in reverse order and the block is released
    pub fn try_allocate_array<T, E>(
        &self,
        count: usize,
        policy: &MemoryPolicy,
        mut init: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<NonNull<T>, ConstructError<E>> {
        let layout = Layout::array::<T>(count).map_err(|_| ConstructError::AllocationFailed)?;

        let (base, block) = if layout.size() == 0 {
            (NonNull::<T>::dangling(), None)
        } else {
            let raw = self
                .allocate_aligned(layout.size(), layout.align(), policy)
                .ok_or(ConstructError::AllocationFailed)?;
            (
                raw.cast::<T>(),
                Some(BlockGuard::new(self, policy, raw, layout.size())),
            )
        };

        // Declared after `block` so elements drop before the block is freed
        let mut elements = ElementsGuard {
            base,
            initialized: 0,
        };
        for index in 0..count {
            let value = init(index).map_err(ConstructError::Constructor)?;
            // SAFETY: index < count, inside the block sized for `count` elements
            unsafe { base.as_ptr().add(index).write(value) };
            elements.initialized += 1;
        }

        mem::forget(elements);
        if let Some(block) = block {
            block.disarm();
        }
        Ok(base)
    }

    /// Drop `count` elements in place and release the block.
    ///
    /// # Safety
    /// `ptr` and `count` must match a previous `allocate_array::<T>` call on
    /// this manager, and the array must not be used afterwards.
    pub unsafe fn deallocate_array<T>(
        &self,
        ptr: NonNull<T>,
        count: usize,
        policy: &MemoryPolicy,
    ) -> MemoryResult<()> {
        let elements = ptr::slice_from_raw_parts_mut(ptr.as_ptr(), count);
        let size = mem::size_of::<T>() * count;
        if size == 0 {
            ptr::drop_in_place(elements);
            return Ok(());
        }

        self.verify_releasable(ptr.as_ptr() as Address, policy.enable_tracking)?;
        let guard = BlockGuard::new(self, policy, ptr.cast(), size);
        ptr::drop_in_place(elements);
        guard.release()
    }
}
