/*!
 * System Limits and Constants
 *
 * Centralized location for allocator capacities, thresholds and tuning knobs.
 * `ManagerConfig::default()` is built from these values.
 *
 * - Performance-critical constants are marked with [PERF]
 * - Values that bound diagnostic memory are marked with [DIAG]
 */

use std::time::Duration;

// =============================================================================
// ALIGNMENT
// =============================================================================

/// Default alignment for every allocator (16 bytes)
/// [PERF] Matches SSE register width so blocks are SIMD-friendly
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Cache line size used for region base alignment and padding
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// ALLOCATOR CAPACITIES
// =============================================================================

/// Shared linear arena reserved by the manager (8MB)
pub const LINEAR_ARENA_CAPACITY: usize = 8 * 1024 * 1024;

/// General-purpose heap used as the fallback for every strategy (32MB)
pub const GENERAL_HEAP_CAPACITY: usize = 32 * 1024 * 1024;

/// Backing heap per NUMA node (8MB)
pub const NUMA_NODE_CAPACITY: usize = 8 * 1024 * 1024;

/// Private region per thread cache (1MB)
pub const THREAD_CACHE_CAPACITY: usize = 1024 * 1024;

/// Largest request served from a thread cache
/// Bigger requests go straight to the shared heap
pub const THREAD_CACHE_MAX_OBJECT: usize = 256;

/// Page size inside a thread cache; each page serves one size class
pub const THREAD_CACHE_PAGE_SIZE: usize = 16 * 1024;

/// Block size of the manager's lock-free allocator
/// [PERF] One cache line, so neighbouring blocks never false-share
pub const LOCKFREE_BLOCK_SIZE: usize = 64;

/// Number of blocks in the manager's lock-free allocator
pub const LOCKFREE_BLOCK_COUNT: usize = 16 * 1024;

/// Slots in the first chunk of every size-class pool
/// Later chunks double in size
pub const SEGREGATED_INITIAL_SLOTS: usize = 256;

/// Maximum chunks a dynamic pool can grow to
pub const MAX_POOL_CHUNKS: usize = 16;

/// Size classes served by the segregated pools
/// Midpoints between powers of two keep internal fragmentation under 33%
pub const SIZE_CLASSES: [usize; 14] = [
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 2048, 4096,
];

/// Largest size class
pub const MAX_SIZE_CLASS: usize = 4096;

// =============================================================================
// GENERAL HEAP
// =============================================================================

/// Minimum block granularity of the general heap
pub const HEAP_GRANULARITY: usize = 16;

/// Small block threshold for segregated free list (4KB)
/// [PERF] Power-of-2 buckets up to this size for O(1) allocation
pub const SMALL_BLOCK_MAX: usize = 4 * 1024;

/// Medium block threshold (64KB)
/// Separates small/medium/large free-list buckets and tracker size classes
pub const MEDIUM_BLOCK_MAX: usize = 64 * 1024;

/// Coalescing interval (every 100 deallocations)
/// [PERF] Amortizes O(n log n) sorting cost across deallocations
pub const DEALLOC_COALESCE_INTERVAL: u64 = 100;

// =============================================================================
// SIMD
// =============================================================================

/// SIMD operation threshold (64 bytes)
/// [PERF] Below this, plain copies are faster than vector setup
pub const MEMORY_SIMD_THRESHOLD: usize = 64;

// =============================================================================
// PRESSURE
// =============================================================================

/// Default byte budget the pressure detector measures against (256MB)
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// Usage ratio at which pressure becomes MODERATE
pub const PRESSURE_MODERATE_RATIO: f64 = 0.50;

/// Usage ratio at which pressure becomes HIGH
pub const PRESSURE_HIGH_RATIO: f64 = 0.75;

/// Usage ratio at which pressure becomes CRITICAL
pub const PRESSURE_CRITICAL_RATIO: f64 = 0.90;

// =============================================================================
// TRACKING AND DIAGNOSTICS
// =============================================================================

/// Upper bound of small allocations in tracker statistics
pub const TRACKER_SMALL_MAX: usize = 256;

/// Freed records kept for double-free detection and history
/// [DIAG] Oldest records are evicted first
pub const RETIRED_RECORD_CAPACITY: usize = 4096;

/// Invalid-free addresses kept for the corruption report
/// [DIAG]
pub const INVALID_FREE_HISTORY: usize = 256;

/// Bandwidth sampling interval
pub const BANDWIDTH_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Bandwidth samples kept in the ring
/// [DIAG]
pub const BANDWIDTH_SAMPLE_CAPACITY: usize = 1000;

/// Efficiency ratio below which the health report flags waste
pub const LOW_EFFICIENCY_RATIO: f64 = 0.5;

/// Pool utilization below which the health report suggests shrinking
pub const LOW_POOL_UTILIZATION: f64 = 0.3;

/// Failed-to-total allocation ratio flagged as a performance issue
pub const HIGH_FAILURE_RATIO: f64 = 0.01;

/// Fallback-to-total allocation ratio flagged as a performance issue
pub const HIGH_FALLBACK_RATIO: f64 = 0.10;

/// Reserved bytes below which efficiency is not judged
/// Tiny workloads are dominated by rounding
pub const EFFICIENCY_MIN_RESERVED: usize = 64 * 1024;
