/*!
 * Memory Manager Tests
 * Strategy dispatch, fallbacks, limits and metrics of the manager facade
 */

use memory_core::memory::allocators::LinearAllocator;
use memory_core::memory::numa::{NumaAllocator, NumaTopology};
use memory_core::{
    AllocationStrategy, ManagerConfig, MemoryError, MemoryManager, MemoryPolicy,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;
use std::sync::Arc;

fn compact_config() -> ManagerConfig {
    ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()))
}

fn manager() -> MemoryManager {
    MemoryManager::new(compact_config()).unwrap()
}

#[test]
fn test_round_trip_leaves_live_bytes_unchanged() {
    let mgr = manager();
    let sizes = [1usize, 16, 48, 64, 200, 1000, 4096, 10_000];

    for strategy in AllocationStrategy::ALL {
        let policy = MemoryPolicy::default().with_strategy(strategy);
        for &size in &sizes {
            let before = mgr.get_performance_metrics().current_allocated_bytes;

            let ptr = mgr
                .allocate(size, &policy)
                .unwrap_or_else(|| panic!("{strategy} failed for {size} bytes"));
            assert_eq!(
                mgr.get_performance_metrics().current_allocated_bytes,
                before + size
            );

            mgr.deallocate(ptr, size, &policy).unwrap();
            assert_eq!(
                mgr.get_performance_metrics().current_allocated_bytes,
                before,
                "{strategy} / {size}"
            );
        }
    }
}

#[test]
fn test_blocks_are_writable_for_their_full_size() {
    let mgr = manager();
    for strategy in AllocationStrategy::ALL {
        let policy = MemoryPolicy::performance(strategy);
        let ptr = mgr.allocate(256, &policy).unwrap();

        // SAFETY: the block is live and 256 bytes long
        let block = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 256) };
        mgr.set_memory(block, 0xA5, &policy);
        assert!(block.iter().all(|&b| b == 0xA5));

        mgr.deallocate(ptr, 256, &policy).unwrap();
    }
}

#[test]
fn test_zero_size_allocations_share_a_token() {
    let mgr = manager();
    let policy = MemoryPolicy::default();

    let a = mgr.allocate(0, &policy).unwrap();
    let b = mgr.allocate(0, &policy).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_ptr() as usize % 16, 0);

    mgr.deallocate(a, 0, &policy).unwrap();
    mgr.deallocate(b, 0, &policy).unwrap();

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.zero_size_allocations, 2);
    assert_eq!(metrics.total_allocations, 0);
    assert_eq!(metrics.current_allocated_bytes, 0);
    assert!(mgr.detect_leaks().is_empty());
}

#[test]
fn test_alignment_is_honoured() {
    let mgr = manager();
    for strategy in AllocationStrategy::ALL {
        let policy = MemoryPolicy::default().with_strategy(strategy);
        for align in [8usize, 16, 64, 256, 4096] {
            let ptr = mgr.allocate_aligned(100, align, &policy).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "{strategy} align {align}");
            mgr.deallocate(ptr, 100, &policy).unwrap();
        }
    }

    let policy = MemoryPolicy::default().with_alignment(128);
    let ptr = mgr.allocate(24, &policy).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 128, 0);
    mgr.deallocate(ptr, 24, &policy).unwrap();
}

#[test]
fn test_invalid_alignment_fails_without_panicking() {
    let mgr = manager();
    let policy = MemoryPolicy::default();

    assert!(mgr.allocate_aligned(64, 3, &policy).is_none());
    assert!(mgr.allocate(64, &policy.clone().with_alignment(0)).is_none());

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.failed_allocations, 2);
    assert_eq!(metrics.current_allocated_bytes, 0);
}

#[test]
fn test_exhausted_lockfree_blocks_fall_back() {
    let mgr = MemoryManager::new(compact_config().with_lockfree_blocks(4)).unwrap();
    let policy = MemoryPolicy::performance(AllocationStrategy::Fastest);

    let blocks: Vec<NonNull<u8>> = (0..5).map(|_| mgr.allocate(32, &policy).unwrap()).collect();

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.total_allocations, 5);
    assert_eq!(metrics.fallback_allocations, 1);

    for ptr in blocks {
        mgr.deallocate(ptr, 32, &policy).unwrap();
    }
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}

#[test]
fn test_skipping_an_ineligible_allocator_is_not_a_fallback() {
    let mgr = manager();
    let policy = MemoryPolicy::performance(AllocationStrategy::Fastest);

    // Too large for the lock-free blocks; the arena serves it first-hand
    let ptr = mgr.allocate(1000, &policy).unwrap();
    assert_eq!(mgr.get_performance_metrics().fallback_allocations, 0);
    mgr.deallocate(ptr, 1000, &policy).unwrap();
}

#[test]
fn test_system_fallback_can_be_disabled() {
    let config = compact_config()
        .with_heap_capacity(64 * 1024)
        .with_system_fallback(false);
    let mgr = MemoryManager::new(config).unwrap();
    let policy = MemoryPolicy::performance(AllocationStrategy::Balanced);

    let first = mgr.allocate(48 * 1024, &policy).unwrap();
    assert!(mgr.allocate(48 * 1024, &policy).is_none());
    assert_eq!(mgr.get_performance_metrics().failed_allocations, 1);

    mgr.deallocate(first, 48 * 1024, &policy).unwrap();
    let again = mgr.allocate(48 * 1024, &policy).unwrap();
    mgr.deallocate(again, 48 * 1024, &policy).unwrap();
}

#[test]
fn test_system_fallback_serves_oversized_requests() {
    let mgr = MemoryManager::new(compact_config().with_heap_capacity(64 * 1024)).unwrap();
    let policy = MemoryPolicy::default();

    let ptr = mgr.allocate(128 * 1024, &policy).unwrap();
    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.fallback_allocations, 1);
    assert_eq!(metrics.current_allocated_bytes, 128 * 1024);

    mgr.deallocate(ptr, 128 * 1024, &policy).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}

#[test]
fn test_hard_limit_refuses_requests() {
    let mgr = MemoryManager::new(compact_config().with_hard_limit(Some(1024))).unwrap();
    let policy = MemoryPolicy::default();

    let ptr = mgr.allocate(1000, &policy).unwrap();
    assert!(mgr.allocate(100, &policy).is_none());
    assert_eq!(mgr.get_performance_metrics().failed_allocations, 1);

    mgr.deallocate(ptr, 1000, &policy).unwrap();
    let ptr = mgr.allocate(100, &policy).unwrap();
    mgr.deallocate(ptr, 100, &policy).unwrap();
}

#[test]
fn test_release_ignores_the_callers_strategy() {
    let mgr = manager();
    let allocate_policy = MemoryPolicy::default().with_strategy(AllocationStrategy::SizeSegregated);
    let free_policy = MemoryPolicy::default().with_strategy(AllocationStrategy::Fastest);

    let ptr = mgr.allocate(96, &allocate_policy).unwrap();
    mgr.deallocate(ptr, 96, &free_policy).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);

    // Untracked blocks are found by address range
    let untracked = MemoryPolicy::performance(AllocationStrategy::NumaAware);
    let ptr = mgr.allocate(512, &untracked).unwrap();
    mgr.deallocate(ptr, 512, &MemoryPolicy::performance(AllocationStrategy::ThreadLocal))
        .unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}

#[test]
fn test_deallocate_unsized_needs_a_record() {
    let mgr = manager();

    let tracked = MemoryPolicy::default();
    let ptr = mgr.allocate(300, &tracked).unwrap();
    mgr.deallocate_unsized(ptr).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);

    let untracked = MemoryPolicy::performance(AllocationStrategy::Balanced);
    let ptr = mgr.allocate(300, &untracked).unwrap();
    let err = mgr.deallocate_unsized(ptr).unwrap_err();
    assert!(matches!(err, MemoryError::SizeUnknown(_)));

    // The block is still live and can be released with its size
    mgr.deallocate(ptr, 300, &untracked).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}

#[test]
fn test_linear_arena_capacity_scenario() {
    let arena = LinearAllocator::new(1024).unwrap();

    assert!(arena.allocate(600).is_some());
    assert!(arena.allocate(600).is_none());
    assert!(arena.remaining() < 600);

    arena.reset();
    assert_eq!(arena.used(), 0);
    assert!(arena.allocate(600).is_some());
    assert_eq!(arena.reset_count(), 1);
}

#[test]
fn test_numa_aware_on_single_node_behaves_like_one_pool() {
    let mgr = manager();
    let policy = MemoryPolicy::default().with_strategy(AllocationStrategy::NumaAware);

    let blocks: Vec<NonNull<u8>> = (0..100)
        .map(|i| {
            mgr.allocate(1024, &policy)
                .unwrap_or_else(|| panic!("allocation {i} failed"))
        })
        .collect();

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.fallback_allocations, 0);
    assert_eq!(metrics.current_allocated_bytes, 100 * 1024);

    let usage = mgr.numa_node_usage();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].used >= 100 * 1024);
    assert_eq!(usage[0].remote_allocations, 0);

    for ptr in blocks {
        mgr.deallocate(ptr, 1024, &policy).unwrap();
    }
    assert_eq!(mgr.numa_node_usage()[0].used, 0);
}

#[test]
fn test_numa_allocator_spills_to_other_nodes() {
    let topology = Arc::new(NumaTopology::simulated(2));
    let numa = NumaAllocator::new(topology, 4096).unwrap();

    let local: Vec<NonNull<u8>> = (0..4)
        .map(|_| numa.allocate_preferring(0, 1024, 16).unwrap())
        .collect();
    assert!(local.iter().all(|ptr| numa.node_of(ptr.as_ptr() as usize) == Some(0)));

    let spilled = numa.allocate_preferring(0, 1024, 16).unwrap();
    assert_eq!(numa.node_of(spilled.as_ptr() as usize), Some(1));
    assert_eq!(numa.cross_node_fallbacks(), 1);

    for ptr in local.into_iter().chain(std::iter::once(spilled)) {
        numa.deallocate(ptr).unwrap();
    }
}

#[test]
fn test_peak_is_monotonic_and_bounds_current() {
    let mgr = manager();
    let policy = MemoryPolicy::performance(AllocationStrategy::Balanced);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut last_peak = 0;

    for _ in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=8192);
            if let Some(ptr) = mgr.allocate(size, &policy) {
                live.push((ptr, size));
            }
        } else {
            let index = rng.gen_range(0..live.len());
            let (ptr, size) = live.swap_remove(index);
            mgr.deallocate(ptr, size, &policy).unwrap();
        }

        let metrics = mgr.get_performance_metrics();
        assert!(metrics.peak_allocated_bytes >= last_peak);
        assert!(metrics.peak_allocated_bytes >= metrics.current_allocated_bytes);
        last_peak = metrics.peak_allocated_bytes;
    }

    for (ptr, size) in live {
        mgr.deallocate(ptr, size, &policy).unwrap();
    }
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}

#[test]
fn test_strategy_counts_follow_requests() {
    let mgr = manager();
    for (strategy, count) in [
        (AllocationStrategy::Fastest, 3usize),
        (AllocationStrategy::ThreadLocal, 2),
        (AllocationStrategy::Balanced, 1),
    ] {
        let policy = MemoryPolicy::performance(strategy);
        for _ in 0..count {
            let ptr = mgr.allocate(32, &policy).unwrap();
            mgr.deallocate(ptr, 32, &policy).unwrap();
        }
    }

    let counts = mgr.get_performance_metrics().strategy_counts;
    assert_eq!(counts.get(&AllocationStrategy::Fastest), Some(&3));
    assert_eq!(counts.get(&AllocationStrategy::ThreadLocal), Some(&2));
    assert_eq!(counts.get(&AllocationStrategy::Balanced), Some(&1));
}

#[test]
fn test_trim_after_release_keeps_manager_usable() {
    let mgr = manager();
    let policy = MemoryPolicy::default().with_strategy(AllocationStrategy::SizeSegregated);

    let blocks: Vec<NonNull<u8>> = (0..200).map(|_| mgr.allocate(128, &policy).unwrap()).collect();
    for ptr in blocks {
        mgr.deallocate(ptr, 128, &policy).unwrap();
    }
    mgr.trim();

    let ptr = mgr.allocate(128, &policy).unwrap();
    mgr.deallocate(ptr, 128, &policy).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}
