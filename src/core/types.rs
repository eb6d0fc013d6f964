/*!
 * Core Types
 * Common types used across the memory subsystem
 */

/// Address type for memory operations
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// NUMA node identifier
pub type NodeId = u32;

/// Inline string used for allocation tags and pool names.
/// Tags are short, so they almost never spill to the heap.
pub type Tag = smartstring::alias::String;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Checked variant of [`align_up`] for values near `usize::MAX`.
#[inline]
pub fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
