/*!
 * Memory Manager
 *
 * Policy-driven facade over the allocator strategies.
 *
 * ## Dispatch
 *
 * Each `AllocationStrategy` maps to a fixed chain of allocators. The first
 * allocator in the chain that can serve the request wins; a success further
 * down the chain is counted as a fallback. Chains end in the general heap,
 * then optionally the system allocator:
 *
 * - **Fastest**: lock-free blocks (≤ 64 B) → linear arena → heap
 * - **MostEfficient / SizeSegregated**: size-class pools → heap
 * - **ThreadLocal**: thread cache (≤ 256 B) → heap
 * - **NumaAware**: local node → other nodes → heap
 * - **Balanced**: size-class pools → heap, or heap → size-class pools once
 *   pressure reaches `High`
 *
 * ## Release
 *
 * Frees never trust the caller's strategy: the owner is recovered from the
 * tracker record or by address-range lookup, so a block may be released
 * under a different policy than it was allocated with.
 */

mod config;
mod diagnostics;
mod dispatch;
mod handle;
mod metrics;
mod ops;
mod pools;
mod typed;

pub use config::ManagerConfig;
pub use handle::{ManagedBox, ObjectFactory};

use crate::core::errors::MemoryResult;
use crate::core::limits::LOCKFREE_BLOCK_SIZE;
use crate::core::types::Address;
use crate::memory::allocators::{
    FreeListAllocator, LinearAllocator, LockFreeAllocator, SegregatedPools, SystemAllocator,
    ThreadLocalAllocator,
};
use crate::memory::numa::{NumaAllocator, NumaTopology};
use crate::memory::pressure::PressureDetector;
use crate::memory::tracker::{BandwidthMonitor, MemoryTracker};
use crate::memory::traits::{BlockAllocator, Pool};
use crate::memory::types::{AllocatorKind, MemoryPolicy};
use ahash::RandomState;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use metrics::ManagerCounters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Memory manager
///
/// All entry points take `&self`; the manager is `Send + Sync`.
pub struct MemoryManager {
    config: ManagerConfig,
    default_policy: ArcSwap<MemoryPolicy>,
    initialized: AtomicBool,

    linear: LinearAllocator,
    lockfree: LockFreeAllocator<LOCKFREE_BLOCK_SIZE>,
    segregated: SegregatedPools,
    thread_local: ThreadLocalAllocator,
    numa: NumaAllocator,
    heap: FreeListAllocator,
    system: SystemAllocator,
    custom_pools: DashMap<String, Arc<dyn Pool>, RandomState>,

    tracker: MemoryTracker,
    bandwidth: BandwidthMonitor,
    pressure: Arc<PressureDetector>,
    counters: ManagerCounters,
}

impl MemoryManager {
    /// Build a manager, reserving every backing region up front
    pub fn new(config: ManagerConfig) -> MemoryResult<Self> {
        config.validate()?;

        let topology = config
            .numa_topology
            .clone()
            .unwrap_or_else(NumaTopology::global);
        let pressure = match &config.pressure_detector {
            Some(detector) => Arc::clone(detector),
            None => Arc::new(PressureDetector::with_thresholds(
                config.memory_budget,
                config.pressure_thresholds,
            )?),
        };

        let manager = Self {
            linear: LinearAllocator::new(config.linear_capacity)?,
            lockfree: LockFreeAllocator::new(config.lockfree_blocks)?,
            segregated: SegregatedPools::new(config.segregated_initial_slots)?,
            thread_local: ThreadLocalAllocator::new(config.thread_cache_capacity)?,
            numa: NumaAllocator::new(topology, config.numa_node_capacity)?,
            heap: FreeListAllocator::new(config.heap_capacity)?,
            system: SystemAllocator::new(),
            custom_pools: DashMap::with_hasher(RandomState::new()),
            tracker: MemoryTracker::with_retired_capacity(config.retired_record_capacity),
            bandwidth: BandwidthMonitor::new(),
            pressure,
            counters: ManagerCounters::default(),
            default_policy: ArcSwap::from_pointee(MemoryPolicy::default()),
            initialized: AtomicBool::new(false),
            config,
        };

        info!(
            linear = manager.config.linear_capacity,
            heap = manager.config.heap_capacity,
            lockfree_blocks = manager.config.lockfree_blocks,
            numa_nodes = manager.numa.topology().node_count(),
            budget = manager.pressure.budget(),
            "Memory manager created"
        );
        Ok(manager)
    }

    /// Process-wide manager with the default configuration.
    ///
    /// # Panics
    /// If the default regions cannot be reserved at first use.
    pub fn global() -> &'static MemoryManager {
        static GLOBAL: OnceLock<MemoryManager> = OnceLock::new();
        GLOBAL.get_or_init(|| match MemoryManager::new(ManagerConfig::default()) {
            Ok(manager) => manager,
            Err(e) => panic!("failed to reserve global memory manager regions: {e}"),
        })
    }

    /// Install `policy` as the default.
    ///
    /// The first call logs the allocator layout; later calls only replace the
    /// default. Live allocations are unaffected either way.
    pub fn initialize(&self, policy: MemoryPolicy) {
        let strategy = policy.strategy;
        self.default_policy.store(Arc::new(policy));
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!(
                default_strategy = %strategy,
                simd = ?crate::memory::simd::init_simd().level(),
                numa_nodes = self.numa.topology().node_count(),
                numa_simulated = self.numa.topology().is_simulated(),
                "Memory manager initialized"
            );
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn default_policy(&self) -> Arc<MemoryPolicy> {
        self.default_policy.load_full()
    }

    pub fn set_default_policy(&self, policy: MemoryPolicy) {
        self.default_policy.store(Arc::new(policy));
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &MemoryTracker {
        &self.tracker
    }

    pub fn pressure_detector(&self) -> &Arc<PressureDetector> {
        &self.pressure
    }

    pub fn numa_topology(&self) -> &Arc<NumaTopology> {
        self.numa.topology()
    }

    /// Built-in allocator behind `kind`
    fn allocator(&self, kind: AllocatorKind) -> Option<&dyn BlockAllocator> {
        Some(match kind {
            AllocatorKind::Linear => &self.linear,
            AllocatorKind::LockFree => &self.lockfree,
            AllocatorKind::Segregated => &self.segregated,
            AllocatorKind::ThreadLocal => &self.thread_local,
            AllocatorKind::Numa => &self.numa,
            AllocatorKind::Heap => &self.heap,
            AllocatorKind::System => &self.system,
            AllocatorKind::CustomPool => return None,
        })
    }

    /// Built-in allocator whose storage contains `address`
    fn owner_of(&self, address: Address) -> Option<AllocatorKind> {
        const SEARCH_ORDER: [AllocatorKind; 7] = [
            AllocatorKind::LockFree,
            AllocatorKind::Segregated,
            AllocatorKind::Heap,
            AllocatorKind::Linear,
            AllocatorKind::ThreadLocal,
            AllocatorKind::Numa,
            AllocatorKind::System,
        ];
        SEARCH_ORDER.into_iter().find(|&kind| {
            self.allocator(kind)
                .map_or(false, |allocator| allocator.owns(address))
        })
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("default_policy", &self.default_policy.load().strategy)
            .field("live_bytes", &self.counters.current())
            .field("pressure", &self.pressure.level())
            .field("custom_pools", &self.custom_pools.len())
            .finish()
    }
}
