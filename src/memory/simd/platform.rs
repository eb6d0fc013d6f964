/*!
 * Platform-specific SIMD Detection
 * Detects available SIMD instruction sets
 */

use serde::Serialize;

/// Widest instruction set the bulk memory routines will use
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SimdLevel {
    Scalar,
    Sse2,
    Avx2,
    Neon,
}

/// SIMD capabilities available on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimdCapabilities {
    /// SSE2 support (x86_64 baseline)
    pub sse2: bool,
    /// AVX2 support (x86_64)
    pub avx2: bool,
    /// NEON support (aarch64)
    pub neon: bool,
}

impl SimdCapabilities {
    pub fn level(&self) -> SimdLevel {
        if self.avx2 {
            SimdLevel::Avx2
        } else if self.sse2 {
            SimdLevel::Sse2
        } else if self.neon {
            SimdLevel::Neon
        } else {
            SimdLevel::Scalar
        }
    }

    /// Bytes moved per vector instruction
    pub fn vector_bytes(&self) -> usize {
        match self.level() {
            SimdLevel::Avx2 => 32,
            SimdLevel::Sse2 | SimdLevel::Neon => 16,
            SimdLevel::Scalar => 8,
        }
    }
}

/// Detect available SIMD instruction sets
pub fn detect_simd_support() -> SimdCapabilities {
    #[cfg(target_arch = "x86_64")]
    {
        SimdCapabilities {
            sse2: is_x86_feature_detected!("sse2"),
            avx2: is_x86_feature_detected!("avx2"),
            neon: false,
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        SimdCapabilities {
            sse2: false,
            avx2: false,
            neon: std::arch::is_aarch64_feature_detected!("neon"),
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        SimdCapabilities {
            sse2: false,
            avx2: false,
            neon: false,
        }
    }
}
