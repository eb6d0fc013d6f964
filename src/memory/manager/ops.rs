/*!
 * Bulk Memory Operations
 * SIMD-backed when the policy prefers it; traffic feeds the bandwidth monitor
 */

use super::MemoryManager;
use crate::memory::simd::{simd_memcmp, simd_memcpy, simd_memset};
use crate::memory::types::MemoryPolicy;
use std::cmp::Ordering;
use std::ops::Range;

impl MemoryManager {
    /// Copy `min(dst.len(), src.len())` bytes; returns the count
    pub fn copy_memory(&self, dst: &mut [u8], src: &[u8], policy: &MemoryPolicy) -> usize {
        let copied = if policy.prefer_simd_operations {
            simd_memcpy(dst, src)
        } else {
            let len = dst.len().min(src.len());
            dst[..len].copy_from_slice(&src[..len]);
            len
        };
        self.bandwidth.record_copy(copied);
        copied
    }

    /// Move `src` to start at `dest` within one buffer; ranges may overlap.
    ///
    /// # Panics
    /// If either range falls outside `buffer`, like `slice::copy_within`.
    pub fn move_memory(&self, buffer: &mut [u8], src: Range<usize>, dest: usize) -> usize {
        let len = src.len();
        buffer.copy_within(src, dest);
        self.bandwidth.record_copy(len);
        len
    }

    pub fn set_memory(&self, dst: &mut [u8], value: u8, policy: &MemoryPolicy) -> usize {
        let written = if policy.prefer_simd_operations {
            simd_memset(dst, value)
        } else {
            dst.fill(value);
            dst.len()
        };
        self.bandwidth.record_write(written);
        written
    }

    pub fn zero_memory(&self, dst: &mut [u8], policy: &MemoryPolicy) -> usize {
        self.set_memory(dst, 0, policy)
    }

    /// Lexicographic comparison, same ordering as `<[u8]>::cmp`
    pub fn compare_memory(&self, a: &[u8], b: &[u8], policy: &MemoryPolicy) -> Ordering {
        self.bandwidth.record_read(a.len() + b.len());
        if policy.prefer_simd_operations {
            simd_memcmp(a, b)
        } else {
            a.cmp(b)
        }
    }
}
