/*!
 * Concurrency Tests
 * Contention on the lock-free allocator and multi-threaded manager use
 */

use dashmap::DashSet;
use memory_core::memory::allocators::{LockFreeAllocator, ThreadLocalAllocator};
use memory_core::memory::numa::NumaTopology;
use memory_core::{AllocationStrategy, ManagerConfig, MemoryManager, MemoryPolicy};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

const THREADS: usize = 8;
const CYCLES: usize = 2_000;

#[test]
fn test_lockfree_blocks_never_alias_under_contention() {
    let allocator = Arc::new(LockFreeAllocator::<64>::new(64).unwrap());
    let live: Arc<DashSet<usize>> = Arc::new(DashSet::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let live = Arc::clone(&live);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut held: Vec<(NonNull<u8>, u64)> = Vec::new();

                for cycle in 0..CYCLES {
                    if held.len() < 4 && rng.gen_bool(0.6) {
                        if let Some(ptr) = allocator.allocate() {
                            let address = ptr.as_ptr() as usize;
                            assert!(live.insert(address), "block 0x{address:x} handed out twice");

                            let stamp = ((t as u64) << 32) | cycle as u64;
                            // SAFETY: the block is ours and 64 bytes long
                            unsafe { ptr.cast::<u64>().as_ptr().write(stamp) };
                            held.push((ptr, stamp));
                        }
                    } else if let Some((ptr, stamp)) = held.pop() {
                        // SAFETY: still ours; nobody else may have written it
                        assert_eq!(unsafe { ptr.cast::<u64>().as_ptr().read() }, stamp);
                        live.remove(&(ptr.as_ptr() as usize));
                        allocator.deallocate(ptr).unwrap();
                    }
                }

                for (ptr, _) in held {
                    live.remove(&(ptr.as_ptr() as usize));
                    allocator.deallocate(ptr).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(live.is_empty());
    assert_eq!(allocator.allocated_count(), 0);
    assert_eq!(
        allocator.available_count() + allocator.allocated_count(),
        allocator.capacity()
    );
    assert_eq!(allocator.free_list_len(), allocator.capacity());
}

#[test]
fn test_lockfree_exhaustion_under_contention_loses_nothing() {
    let allocator = Arc::new(LockFreeAllocator::<32>::new(16).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let mut failures = 0;
                for _ in 0..500 {
                    let grabbed: Vec<NonNull<u8>> =
                        (0..4).filter_map(|_| allocator.allocate()).collect();
                    failures += 4 - grabbed.len();
                    for ptr in grabbed {
                        allocator.deallocate(ptr).unwrap();
                    }
                }
                failures
            })
        })
        .collect();

    let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allocator.failed_count() as usize, failures);
    assert_eq!(allocator.available_count(), 16);
    assert_eq!(allocator.free_list_len(), 16);
}

#[test]
fn test_manager_is_shared_across_threads() {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    let mgr = MemoryManager::new(config).unwrap();
    let strategies = [
        AllocationStrategy::Balanced,
        AllocationStrategy::Fastest,
        AllocationStrategy::ThreadLocal,
        AllocationStrategy::SizeSegregated,
    ];

    thread::scope(|scope| {
        for (t, strategy) in strategies.into_iter().enumerate() {
            let mgr = &mgr;
            scope.spawn(move || {
                let policy = MemoryPolicy::default()
                    .with_strategy(strategy)
                    .with_tag(format!("worker-{t}"));
                let mut rng = StdRng::seed_from_u64(100 + t as u64);
                for _ in 0..500 {
                    let size = rng.gen_range(1..=512);
                    let ptr = mgr.allocate(size, &policy).unwrap();
                    // SAFETY: the block is live and `size` bytes long
                    unsafe { ptr.as_ptr().write_bytes(t as u8, size) };
                    mgr.deallocate(ptr, size, &policy).unwrap();
                }
            });
        }
    });

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.total_allocations, 2_000);
    assert_eq!(metrics.total_deallocations, 2_000);
    assert_eq!(metrics.current_allocated_bytes, 0);
    assert!(mgr.detect_leaks().is_empty());
    assert_eq!(mgr.allocation_statistics().unique_threads, strategies.len());
}

#[test]
fn test_blocks_freed_by_another_thread() {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    let mgr = MemoryManager::new(config).unwrap();
    let policy = MemoryPolicy::default().with_strategy(AllocationStrategy::ThreadLocal);

    let addresses: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = &mgr;
                let policy = &policy;
                scope.spawn(move || {
                    (0..100)
                        .map(|_| mgr.allocate(48, policy).unwrap().as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 400 * 48);
    for address in addresses {
        let ptr = NonNull::new(address as *mut u8).unwrap();
        mgr.deallocate(ptr, 48, &policy).unwrap();
    }
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
    assert!(mgr.detect_leaks().is_empty());
}

#[test]
fn test_thread_cache_counts_remote_frees() {
    let allocator = Arc::new(ThreadLocalAllocator::new(64 * 1024).unwrap());

    let worker = Arc::clone(&allocator);
    let addresses = thread::spawn(move || {
        (0..32)
            .map(|_| worker.allocate(64, 16).unwrap().as_ptr() as usize)
            .collect::<Vec<_>>()
    })
    .join()
    .unwrap();

    assert!(!allocator.has_local_cache());
    for address in &addresses {
        allocator
            .deallocate(NonNull::new(*address as *mut u8).unwrap())
            .unwrap();
    }
    assert_eq!(allocator.remote_free_count(), 32);
}
