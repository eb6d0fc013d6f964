/*!
 * Managed Objects
 * Opt-in per-type routing through a fixed policy, with RAII release
 */

use super::MemoryManager;
use crate::core::errors::ConstructError;
use crate::memory::types::MemoryPolicy;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::warn;

/// Creates `T`s through one manager under one policy
pub struct ObjectFactory<'m, T> {
    manager: &'m MemoryManager,
    policy: Arc<MemoryPolicy>,
    _marker: PhantomData<fn() -> T>,
}

impl<'m, T> ObjectFactory<'m, T> {
    pub fn new(manager: &'m MemoryManager, policy: MemoryPolicy) -> Self {
        Self {
            manager,
            policy: Arc::new(policy),
            _marker: PhantomData,
        }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    pub fn create(&self, value: T) -> Option<ManagedBox<'m, T>> {
        self.create_with(|| value)
    }

    pub fn create_with(&self, ctor: impl FnOnce() -> T) -> Option<ManagedBox<'m, T>> {
        let ptr = self.manager.allocate_object(&self.policy, ctor)?;
        Some(ManagedBox::from_parts(self.manager, Arc::clone(&self.policy), ptr))
    }

    pub fn try_create_with<E>(
        &self,
        ctor: impl FnOnce() -> Result<T, E>,
    ) -> Result<ManagedBox<'m, T>, ConstructError<E>> {
        let ptr = self.manager.try_allocate_object(&self.policy, ctor)?;
        Ok(ManagedBox::from_parts(
            self.manager,
            Arc::clone(&self.policy),
            ptr,
        ))
    }
}

impl<T> Clone for ObjectFactory<'_, T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager,
            policy: Arc::clone(&self.policy),
            _marker: PhantomData,
        }
    }
}

impl MemoryManager {
    /// Factory routing every `T` it creates through `policy`
    pub fn factory<T>(&self, policy: MemoryPolicy) -> ObjectFactory<'_, T> {
        ObjectFactory::new(self, policy)
    }
}

/// Owning pointer to a `T` allocated through a manager; dropped and
/// released through the same manager
pub struct ManagedBox<'m, T> {
    ptr: NonNull<T>,
    manager: &'m MemoryManager,
    policy: Arc<MemoryPolicy>,
    _owns: PhantomData<T>,
}

// SAFETY: the box uniquely owns its `T`; the manager is Sync
unsafe impl<T: Send> Send for ManagedBox<'_, T> {}
unsafe impl<T: Sync> Sync for ManagedBox<'_, T> {}

impl<'m, T> ManagedBox<'m, T> {
    fn from_parts(manager: &'m MemoryManager, policy: Arc<MemoryPolicy>, ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            manager,
            policy,
            _owns: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Give up ownership; release with `MemoryManager::deallocate_object`
    /// under the returned policy
    pub fn into_raw(self) -> (NonNull<T>, Arc<MemoryPolicy>) {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the policy is moved out once
        let policy = unsafe { std::ptr::read(&this.policy) };
        (this.ptr, policy)
    }
}

impl<T> Deref for ManagedBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the pointee is initialized and owned for the box's lifetime
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for ManagedBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` is unique
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for ManagedBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `allocate_object::<T>` under this policy
        if let Err(e) = unsafe { self.manager.deallocate_object(self.ptr, &self.policy) } {
            warn!(error = %e, "Failed to release managed object");
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ManagedBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
