/*!
 * SIMD-Accelerated Memory Operations
 *
 * Bulk copy, fill and compare with AVX2/SSE2/NEON paths. The instruction
 * set is detected once; requests under 64 bytes always take the plain path.
 */

mod operations;
mod platform;

pub use operations::{first_difference, simd_memcmp, simd_memcpy, simd_memset, simd_zero};
pub use platform::{detect_simd_support, SimdCapabilities, SimdLevel};

use std::sync::OnceLock;

/// Global SIMD capabilities
static SIMD_CAPS: OnceLock<SimdCapabilities> = OnceLock::new();

/// Detect SIMD capabilities and log them once
pub fn init_simd() -> &'static SimdCapabilities {
    SIMD_CAPS.get_or_init(|| {
        let caps = platform::detect_simd_support();
        tracing::info!(
            sse2 = caps.sse2,
            avx2 = caps.avx2,
            neon = caps.neon,
            level = ?caps.level(),
            vector_bytes = caps.vector_bytes(),
            "SIMD capabilities detected"
        );
        caps
    })
}

/// Get SIMD capabilities
pub fn capabilities() -> &'static SimdCapabilities {
    SIMD_CAPS.get_or_init(platform::detect_simd_support)
}
