/*!
 * Memory Types
 * Policies, strategies and report types shared across the memory subsystem
 */

use crate::core::limits::DEFAULT_ALIGNMENT;
use crate::core::types::{NodeId, Size, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Allocation strategy requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest latency; may waste memory
    Fastest,
    /// Size class with the least internal fragmentation
    MostEfficient,
    /// Always the bucketed pool set
    SizeSegregated,
    /// Calling thread's private cache
    ThreadLocal,
    /// Pool bound to the calling thread's NUMA node
    NumaAware,
    /// Pooled under low pressure, general heap under high pressure
    Balanced,
}

impl AllocationStrategy {
    pub const ALL: [AllocationStrategy; 6] = [
        Self::Fastest,
        Self::MostEfficient,
        Self::SizeSegregated,
        Self::ThreadLocal,
        Self::NumaAware,
        Self::Balanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fastest => "fastest",
            Self::MostEfficient => "most_efficient",
            Self::SizeSegregated => "size_segregated",
            Self::ThreadLocal => "thread_local",
            Self::NumaAware => "numa_aware",
            Self::Balanced => "balanced",
        }
    }
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        Self::Balanced
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete allocator that satisfied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    Linear,
    LockFree,
    Segregated,
    ThreadLocal,
    Numa,
    Heap,
    System,
    CustomPool,
}

impl AllocatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear arena",
            Self::LockFree => "lock-free allocator",
            Self::Segregated => "segregated pools",
            Self::ThreadLocal => "thread-local allocator",
            Self::Numa => "NUMA allocator",
            Self::Heap => "general heap",
            Self::System => "system allocator",
            Self::CustomPool => "custom pool",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call allocation policy.
///
/// The manager only ever reads a caller's policy; `with_*` builders return
/// modified copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    pub strategy: AllocationStrategy,
    pub allocation_tag: Tag,
    pub alignment: usize,
    pub enable_tracking: bool,
    pub enable_leak_detection: bool,
    pub enable_stack_traces: bool,
    /// Marks blocks as sensitive; they are wiped before release
    pub enable_memory_encryption: bool,
    pub prefer_simd_operations: bool,
    pub enable_automatic_cleanup: bool,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::Balanced,
            allocation_tag: Tag::from("general"),
            alignment: DEFAULT_ALIGNMENT,
            enable_tracking: true,
            enable_leak_detection: true,
            enable_stack_traces: false,
            enable_memory_encryption: false,
            prefer_simd_operations: true,
            enable_automatic_cleanup: true,
        }
    }
}

impl MemoryPolicy {
    /// Policy for hot paths: no tracking, no diagnostics
    pub fn performance(strategy: AllocationStrategy) -> Self {
        Self {
            strategy,
            enable_tracking: false,
            enable_leak_detection: false,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_tag(mut self, tag: impl AsRef<str>) -> Self {
        self.allocation_tag = Tag::from(tag.as_ref());
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.enable_tracking = enabled;
        self
    }

    pub fn with_leak_detection(mut self, enabled: bool) -> Self {
        self.enable_leak_detection = enabled;
        self
    }

    pub fn with_stack_traces(mut self, enabled: bool) -> Self {
        self.enable_stack_traces = enabled;
        self
    }

    pub fn with_memory_encryption(mut self, enabled: bool) -> Self {
        self.enable_memory_encryption = enabled;
        self
    }

    pub fn with_simd(mut self, enabled: bool) -> Self {
        self.prefer_simd_operations = enabled;
        self
    }

    pub fn with_automatic_cleanup(mut self, enabled: bool) -> Self {
        self.enable_automatic_cleanup = enabled;
        self
    }
}

/// Memory pressure levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PressureLevel {
    #[default]
    Low = 0,
    Moderate = 1,
    High = 2,
    Critical = 3,
}

impl PressureLevel {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Moderate,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PressureLevel::Low => write!(f, "LOW"),
            PressureLevel::Moderate => write!(f, "MODERATE"),
            PressureLevel::High => write!(f, "HIGH"),
            PressureLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Usage of a single allocator's backing storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorUsage {
    /// Bytes reserved from the system for this allocator
    pub capacity: Size,
    /// Bytes currently handed out, including rounding and padding
    pub used: Size,
    /// Live blocks
    pub live_blocks: usize,
}

impl AllocatorUsage {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

/// Statistics of a fixed-slot pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub slot_size: Size,
    pub capacity: usize,
    pub used: usize,
    pub chunks: usize,
    pub allocations: u64,
    pub deallocations: u64,
    pub failed_allocations: u64,
    pub grow_events: u64,
    pub shrink_events: u64,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

/// Utilization entry of one pool in the metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub name: String,
    pub slot_size: Size,
    pub capacity: usize,
    pub used: usize,
    pub utilization: f64,
}

/// Point-in-time snapshot of manager metrics.
///
/// Counters are read independently; the snapshot is not globally consistent
/// but no individual counter is torn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub failed_allocations: u64,
    pub fallback_allocations: u64,
    pub zero_size_allocations: u64,
    pub total_allocated_bytes: u64,
    pub current_allocated_bytes: Size,
    pub peak_allocated_bytes: Size,
    pub reserved_bytes: Size,
    /// Useful bytes over reserved bytes
    pub memory_efficiency: f64,
    pub current_read_bandwidth_mbps: f64,
    pub current_write_bandwidth_mbps: f64,
    pub peak_read_bandwidth_mbps: f64,
    pub peak_write_bandwidth_mbps: f64,
    pub pool_utilization: Vec<PoolUtilization>,
    pub average_pool_utilization: f64,
    pub active_pools: usize,
    pub numa_node_utilization: BTreeMap<NodeId, f64>,
    pub current_pressure: PressureLevel,
    pub strategy_counts: BTreeMap<AllocationStrategy, u64>,
}

/// Diagnostic summary derived from tracker and metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub has_memory_leaks: bool,
    pub leaked_allocations: usize,
    pub leaked_bytes: Size,
    pub has_memory_corruption: bool,
    pub double_frees: u64,
    pub invalid_frees: u64,
    pub has_performance_issues: bool,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !self.has_memory_leaks && !self.has_memory_corruption && !self.has_performance_issues
    }
}
