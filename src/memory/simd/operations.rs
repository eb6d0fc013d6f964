/*!
 * SIMD Memory Operations
 * Bulk copy, fill and compare dispatched on the detected SIMD level
 */

use super::capabilities;
#[allow(unused_imports)]
use super::platform::SimdLevel;
use crate::core::limits::MEMORY_SIMD_THRESHOLD as SIMD_THRESHOLD;
use std::cmp::Ordering;

/// Copy `min(dst.len(), src.len())` bytes, returning the count copied
pub fn simd_memcpy(dst: &mut [u8], src: &[u8]) -> usize {
    let len = dst.len().min(src.len());
    if len < SIMD_THRESHOLD {
        dst[..len].copy_from_slice(&src[..len]);
        return len;
    }

    match capabilities().level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::copy_avx2(dst.as_mut_ptr(), src.as_ptr(), len) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { x86::copy_sse2(dst.as_mut_ptr(), src.as_ptr(), len) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::copy(dst.as_mut_ptr(), src.as_ptr(), len) },
        _ => dst[..len].copy_from_slice(&src[..len]),
    }
    len
}

/// Fill `dst` with `value`
pub fn simd_memset(dst: &mut [u8], value: u8) -> usize {
    let len = dst.len();
    if len < SIMD_THRESHOLD {
        dst.fill(value);
        return len;
    }

    match capabilities().level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::set_avx2(dst.as_mut_ptr(), value, len) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { x86::set_sse2(dst.as_mut_ptr(), value, len) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::set(dst.as_mut_ptr(), value, len) },
        _ => dst.fill(value),
    }
    len
}

#[inline]
pub fn simd_zero(dst: &mut [u8]) -> usize {
    simd_memset(dst, 0)
}

/// Lexicographic comparison, same result as `a.cmp(b)`
pub fn simd_memcmp(a: &[u8], b: &[u8]) -> Ordering {
    match first_difference(a, b) {
        Some(index) => a[index].cmp(&b[index]),
        None => a.len().cmp(&b.len()),
    }
}

/// Index of the first differing byte within the common prefix
pub fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    let len = a.len().min(b.len());
    if len < SIMD_THRESHOLD {
        return scalar_first_difference(&a[..len], &b[..len], 0);
    }

    match capabilities().level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::diff_avx2(a, b, len) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { x86::diff_sse2(a, b, len) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::diff(a, b, len) },
        _ => scalar_first_difference(&a[..len], &b[..len], 0),
    }
}

#[inline]
fn scalar_first_difference(a: &[u8], b: &[u8], base: usize) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .map(|index| base + index)
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::scalar_first_difference;
    use std::arch::x86_64::*;
    use std::ptr;

    #[target_feature(enable = "avx2")]
    pub unsafe fn copy_avx2(dst: *mut u8, src: *const u8, len: usize) {
        let mut i = 0;
        while i + 32 <= len {
            let v = _mm256_loadu_si256(src.add(i) as *const __m256i);
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, v);
            i += 32;
        }
        ptr::copy_nonoverlapping(src.add(i), dst.add(i), len - i);
    }

    #[target_feature(enable = "sse2")]
    pub unsafe fn copy_sse2(dst: *mut u8, src: *const u8, len: usize) {
        let mut i = 0;
        while i + 16 <= len {
            let v = _mm_loadu_si128(src.add(i) as *const __m128i);
            _mm_storeu_si128(dst.add(i) as *mut __m128i, v);
            i += 16;
        }
        ptr::copy_nonoverlapping(src.add(i), dst.add(i), len - i);
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn set_avx2(dst: *mut u8, value: u8, len: usize) {
        let v = _mm256_set1_epi8(value as i8);
        let mut i = 0;
        while i + 32 <= len {
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, v);
            i += 32;
        }
        ptr::write_bytes(dst.add(i), value, len - i);
    }

    #[target_feature(enable = "sse2")]
    pub unsafe fn set_sse2(dst: *mut u8, value: u8, len: usize) {
        let v = _mm_set1_epi8(value as i8);
        let mut i = 0;
        while i + 16 <= len {
            _mm_storeu_si128(dst.add(i) as *mut __m128i, v);
            i += 16;
        }
        ptr::write_bytes(dst.add(i), value, len - i);
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn diff_avx2(a: &[u8], b: &[u8], len: usize) -> Option<usize> {
        let (pa, pb) = (a.as_ptr(), b.as_ptr());
        let mut i = 0;
        while i + 32 <= len {
            let va = _mm256_loadu_si256(pa.add(i) as *const __m256i);
            let vb = _mm256_loadu_si256(pb.add(i) as *const __m256i);
            let mask = _mm256_movemask_epi8(_mm256_cmpeq_epi8(va, vb)) as u32;
            if mask != u32::MAX {
                return Some(i + (!mask).trailing_zeros() as usize);
            }
            i += 32;
        }
        scalar_first_difference(&a[i..len], &b[i..len], i)
    }

    #[target_feature(enable = "sse2")]
    pub unsafe fn diff_sse2(a: &[u8], b: &[u8], len: usize) -> Option<usize> {
        let (pa, pb) = (a.as_ptr(), b.as_ptr());
        let mut i = 0;
        while i + 16 <= len {
            let va = _mm_loadu_si128(pa.add(i) as *const __m128i);
            let vb = _mm_loadu_si128(pb.add(i) as *const __m128i);
            let mask = _mm_movemask_epi8(_mm_cmpeq_epi8(va, vb)) as u32;
            if mask != 0xFFFF {
                return Some(i + (!mask & 0xFFFF).trailing_zeros() as usize);
            }
            i += 16;
        }
        scalar_first_difference(&a[i..len], &b[i..len], i)
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use super::scalar_first_difference;
    use std::arch::aarch64::*;
    use std::ptr;

    #[target_feature(enable = "neon")]
    pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) {
        let mut i = 0;
        while i + 16 <= len {
            vst1q_u8(dst.add(i), vld1q_u8(src.add(i)));
            i += 16;
        }
        ptr::copy_nonoverlapping(src.add(i), dst.add(i), len - i);
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn set(dst: *mut u8, value: u8, len: usize) {
        let v = vdupq_n_u8(value);
        let mut i = 0;
        while i + 16 <= len {
            vst1q_u8(dst.add(i), v);
            i += 16;
        }
        ptr::write_bytes(dst.add(i), value, len - i);
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn diff(a: &[u8], b: &[u8], len: usize) -> Option<usize> {
        let (pa, pb) = (a.as_ptr(), b.as_ptr());
        let mut i = 0;
        while i + 16 <= len {
            let eq = vceqq_u8(vld1q_u8(pa.add(i)), vld1q_u8(pb.add(i)));
            if vminvq_u8(eq) != 0xFF {
                return scalar_first_difference(&a[i..i + 16], &b[i..i + 16], i);
            }
            i += 16;
        }
        scalar_first_difference(&a[i..len], &b[i..len], i)
    }
}
