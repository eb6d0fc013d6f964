/*!
 * Manager Configuration
 *
 * Capacities and limits of the allocators a `MemoryManager` composes
 */

use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::*;
use crate::core::types::Size;
use crate::memory::allocators::MAX_LINEAR_CAPACITY;
use crate::memory::numa::NumaTopology;
use crate::memory::pressure::{PressureDetector, PressureThresholds};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Memory manager configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Arena behind the `Fastest` strategy (default: 8 MB)
    pub linear_capacity: Size,

    /// General-purpose heap every strategy falls back to (default: 32 MB)
    pub heap_capacity: Size,

    /// Heap per NUMA node (default: 8 MB)
    pub numa_node_capacity: Size,

    /// Region of each thread cache (default: 1 MB)
    pub thread_cache_capacity: Size,

    /// Blocks in the lock-free allocator (default: 16K × 64 B)
    pub lockfree_blocks: usize,

    /// Slots of the first chunk of a 16-byte class; larger classes scale down
    pub segregated_initial_slots: usize,

    /// Bytes pressure levels are measured against (default: 256 MB)
    pub memory_budget: Size,

    pub pressure_thresholds: PressureThresholds,

    /// Requests that would push live bytes past this limit fail
    pub hard_limit: Option<Size>,

    /// Use the global allocator once every pool in a chain is exhausted
    pub allow_system_fallback: bool,

    /// Freed addresses remembered for double-free detection
    pub retired_record_capacity: usize,

    /// Topology override; the detected process topology otherwise
    #[serde(skip)]
    pub numa_topology: Option<Arc<NumaTopology>>,

    /// Shared detector; a private one sized from `memory_budget` otherwise
    #[serde(skip)]
    pub pressure_detector: Option<Arc<PressureDetector>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            linear_capacity: LINEAR_ARENA_CAPACITY,
            heap_capacity: GENERAL_HEAP_CAPACITY,
            numa_node_capacity: NUMA_NODE_CAPACITY,
            thread_cache_capacity: THREAD_CACHE_CAPACITY,
            lockfree_blocks: LOCKFREE_BLOCK_COUNT,
            segregated_initial_slots: SEGREGATED_INITIAL_SLOTS,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            pressure_thresholds: PressureThresholds::default(),
            hard_limit: None,
            allow_system_fallback: true,
            retired_record_capacity: RETIRED_RECORD_CAPACITY,
            numa_topology: None,
            pressure_detector: None,
        }
    }
}

impl ManagerConfig {
    /// Small regions, for tests and memory-constrained embedders
    pub fn compact() -> Self {
        Self {
            linear_capacity: 64 * 1024,
            heap_capacity: 1024 * 1024,
            numa_node_capacity: 256 * 1024,
            thread_cache_capacity: 4 * THREAD_CACHE_PAGE_SIZE,
            lockfree_blocks: 256,
            segregated_initial_slots: 16,
            memory_budget: 4 * 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn with_linear_capacity(mut self, bytes: Size) -> Self {
        self.linear_capacity = bytes;
        self
    }

    pub fn with_heap_capacity(mut self, bytes: Size) -> Self {
        self.heap_capacity = bytes;
        self
    }

    pub fn with_numa_node_capacity(mut self, bytes: Size) -> Self {
        self.numa_node_capacity = bytes;
        self
    }

    pub fn with_thread_cache_capacity(mut self, bytes: Size) -> Self {
        self.thread_cache_capacity = bytes;
        self
    }

    pub fn with_lockfree_blocks(mut self, blocks: usize) -> Self {
        self.lockfree_blocks = blocks;
        self
    }

    pub fn with_segregated_initial_slots(mut self, slots: usize) -> Self {
        self.segregated_initial_slots = slots;
        self
    }

    pub fn with_memory_budget(mut self, bytes: Size) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_pressure_thresholds(mut self, thresholds: PressureThresholds) -> Self {
        self.pressure_thresholds = thresholds;
        self
    }

    pub fn with_hard_limit(mut self, limit: Option<Size>) -> Self {
        self.hard_limit = limit;
        self
    }

    pub fn with_system_fallback(mut self, allowed: bool) -> Self {
        self.allow_system_fallback = allowed;
        self
    }

    pub fn with_retired_record_capacity(mut self, records: usize) -> Self {
        self.retired_record_capacity = records;
        self
    }

    pub fn with_numa_topology(mut self, topology: Arc<NumaTopology>) -> Self {
        self.numa_topology = Some(topology);
        self
    }

    pub fn with_pressure_detector(mut self, detector: Arc<PressureDetector>) -> Self {
        self.pressure_detector = Some(detector);
        self
    }

    pub fn validate(&self) -> MemoryResult<()> {
        let nonzero = [
            ("linear_capacity", self.linear_capacity),
            ("heap_capacity", self.heap_capacity),
            ("numa_node_capacity", self.numa_node_capacity),
            ("thread_cache_capacity", self.thread_cache_capacity),
            ("lockfree_blocks", self.lockfree_blocks),
            ("segregated_initial_slots", self.segregated_initial_slots),
            ("memory_budget", self.memory_budget),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(MemoryError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.linear_capacity > MAX_LINEAR_CAPACITY {
            return Err(MemoryError::InvalidConfig(format!(
                "linear_capacity {} exceeds {}",
                self.linear_capacity, MAX_LINEAR_CAPACITY
            )));
        }
        if self.lockfree_blocks >= u32::MAX as usize {
            return Err(MemoryError::InvalidConfig(
                "lockfree_blocks must fit in 32 bits".into(),
            ));
        }
        if self.thread_cache_capacity < THREAD_CACHE_PAGE_SIZE {
            return Err(MemoryError::InvalidConfig(format!(
                "thread_cache_capacity must hold at least one {THREAD_CACHE_PAGE_SIZE}-byte page"
            )));
        }
        self.pressure_thresholds.validate()
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("linear_capacity", &self.linear_capacity)
            .field("heap_capacity", &self.heap_capacity)
            .field("numa_node_capacity", &self.numa_node_capacity)
            .field("thread_cache_capacity", &self.thread_cache_capacity)
            .field("lockfree_blocks", &self.lockfree_blocks)
            .field("segregated_initial_slots", &self.segregated_initial_slots)
            .field("memory_budget", &self.memory_budget)
            .field("pressure_thresholds", &self.pressure_thresholds)
            .field("hard_limit", &self.hard_limit)
            .field("allow_system_fallback", &self.allow_system_fallback)
            .field("retired_record_capacity", &self.retired_record_capacity)
            .field("numa_topology", &self.numa_topology.as_ref().map(|t| t.node_count()))
            .finish()
    }
}
