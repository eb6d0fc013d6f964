/*!
 * Pool Tests
 * Object pools, dynamic pools, size classes and custom pool routing
 */

use memory_core::core::limits::{MAX_SIZE_CLASS, SIZE_CLASSES};
use memory_core::memory::allocators::{size_class_index, DynamicPool, ObjectPool, SlabPool};
use memory_core::memory::numa::NumaTopology;
use memory_core::memory::Pool;
use memory_core::{ManagerConfig, MemoryError, MemoryManager, MemoryPolicy};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::ptr::NonNull;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
}

fn particle(seed: f32) -> Particle {
    Particle {
        position: [seed; 3],
        velocity: [-seed; 3],
    }
}

fn manager() -> MemoryManager {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    MemoryManager::new(config).unwrap()
}

#[test]
fn test_pointer_from_another_pool_is_rejected() {
    let a: ObjectPool<Particle> = ObjectPool::new(8).unwrap();
    let b: ObjectPool<Particle> = ObjectPool::new(8).unwrap();

    let ptr = a.create(particle(1.0)).unwrap();
    let err = b.deallocate(ptr).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignPointer { .. }));

    // Neither pool was disturbed
    assert_eq!(a.used(), 1);
    assert_eq!(b.used(), 0);
    // SAFETY: `ptr` holds a live Particle from `a`
    assert_eq!(unsafe { *ptr.as_ptr() }, particle(1.0));

    a.deallocate(ptr).unwrap();
    assert_eq!(a.used(), 0);
}

#[test]
fn test_full_pool_returns_none_and_recovers() {
    let pool: ObjectPool<Particle> = ObjectPool::new(4).unwrap();
    let slots: Vec<NonNull<Particle>> = (0..4)
        .map(|i| pool.create(particle(i as f32)).unwrap())
        .collect();

    assert!(pool.allocate().is_none());
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.stats().failed_allocations, 1);

    pool.deallocate(slots[2]).unwrap();
    let reused = pool.create(particle(9.0)).unwrap();
    assert_eq!(reused, slots[2]);

    // Untouched slots kept their values through the failed allocation
    for (i, ptr) in slots.iter().enumerate().filter(|(i, _)| *i != 2) {
        // SAFETY: the slot is live and initialized
        assert_eq!(unsafe { *ptr.as_ptr() }, particle(i as f32));
    }
}

#[test]
fn test_pool_double_free_is_detected() {
    let pool: ObjectPool<u64> = ObjectPool::new(2).unwrap();
    let ptr = pool.create(7).unwrap();

    pool.deallocate(ptr).unwrap();
    let err = pool.deallocate(ptr).unwrap_err();
    assert!(matches!(err, MemoryError::DoubleFree(_)));
    assert_eq!(pool.used(), 0);
}

#[test]
fn test_misaligned_interior_pointer_is_rejected() {
    let pool = SlabPool::new(32, 16, 4).unwrap();
    let ptr = pool.allocate().unwrap();

    // SAFETY: the offset stays inside the first slot
    let interior = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(8)) };
    assert!(matches!(
        pool.deallocate(interior),
        Err(MemoryError::InvalidFree(_))
    ));
    pool.deallocate(ptr).unwrap();
}

#[test]
fn test_dynamic_pool_grows_and_shrinks() {
    let pool = DynamicPool::new(64, 16, 4).unwrap();

    let blocks: Vec<NonNull<u8>> = (0..12).map(|_| pool.allocate().unwrap()).collect();
    let stats = Pool::stats(&pool);
    assert_eq!(stats.used, 12);
    assert!(stats.chunks >= 2);
    assert!(stats.grow_events >= 1);

    for ptr in blocks {
        pool.deallocate(ptr).unwrap();
    }
    assert!(pool.try_shrink() > 0);
    assert_eq!(Pool::stats(&pool).chunks, 1);
}

#[test]
fn test_dynamic_pool_respects_chunk_limit() {
    let pool = DynamicPool::with_max_chunks(32, 16, 2, 1).unwrap();
    let a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    assert!(pool.allocate().is_none());

    pool.deallocate(a).unwrap();
    pool.deallocate(b).unwrap();
}

#[test]
fn test_custom_pools_route_and_isolate() {
    let mgr = manager();
    mgr.register_custom_pool("particles", Arc::new(SlabPool::new(24, 8, 4).unwrap()))
        .unwrap();
    mgr.register_custom_pool("meshes", Arc::new(SlabPool::new(256, 16, 2).unwrap()))
        .unwrap();

    let duplicate =
        mgr.register_custom_pool("particles", Arc::new(SlabPool::new(8, 8, 1).unwrap()));
    assert!(matches!(duplicate, Err(MemoryError::PoolAlreadyRegistered(_))));

    let policy = MemoryPolicy::default().with_alignment(8).with_tag("particle");
    let ptr = mgr.allocate_from_pool("particles", 24, &policy).unwrap();
    let record = mgr.tracker().lookup(ptr.as_ptr() as usize).unwrap();
    assert_eq!(record.pool.as_deref(), Some("particles"));

    // Too big for the slots and unknown pools both fail softly
    assert!(mgr.allocate_from_pool("particles", 64, &policy).is_none());
    assert!(mgr.allocate_from_pool("missing", 8, &policy).is_none());

    let err = mgr.deallocate_to_pool("meshes", ptr).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignPointer { .. }));
    assert_eq!(mgr.corruption_report().invalid_frees, 1);

    mgr.deallocate_to_pool("particles", ptr).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
    assert!(mgr.detect_leaks().is_empty());
}

#[test]
fn test_custom_pool_blocks_release_through_generic_deallocate() {
    let mgr = manager();
    mgr.register_custom_pool("scratch", Arc::new(SlabPool::new(128, 16, 2).unwrap()))
        .unwrap();

    // Untracked, so the owner is found by address
    let policy = MemoryPolicy::default().with_tracking(false);
    let ptr = mgr.allocate_from_pool("scratch", 100, &policy).unwrap();
    mgr.deallocate(ptr, 100, &policy).unwrap();

    let stats = mgr.custom_pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].0, "scratch");
    assert_eq!(stats[0].1.used, 0);

    assert!(mgr.unregister_custom_pool("scratch").is_some());
    assert!(mgr.custom_pool("scratch").is_none());
}

#[test]
fn test_exhausted_custom_pool_counts_a_failure() {
    let mgr = manager();
    mgr.register_custom_pool("tiny", Arc::new(SlabPool::new(16, 16, 1).unwrap()))
        .unwrap();
    let policy = MemoryPolicy::default();

    let ptr = mgr.allocate_from_pool("tiny", 16, &policy).unwrap();
    assert!(mgr.allocate_from_pool("tiny", 16, &policy).is_none());
    assert_eq!(mgr.get_performance_metrics().failed_allocations, 1);

    mgr.deallocate_to_pool("tiny", ptr).unwrap();
}

#[test]
fn test_oversized_requests_have_no_size_class() {
    assert_eq!(size_class_index(MAX_SIZE_CLASS + 1, 16), None);
    assert_eq!(size_class_index(0, 16), Some(0));
    assert_eq!(size_class_index(4096, 16), Some(SIZE_CLASSES.len() - 1));
}

proptest! {
    #[test]
    fn prop_size_class_is_smallest_fit(size in 1usize..=MAX_SIZE_CLASS, align_shift in 0u32..=4) {
        let align = 1usize << align_shift;
        let index = size_class_index(size, align).unwrap();
        let class = SIZE_CLASSES[index];

        prop_assert!(class >= size);
        prop_assert_eq!(class % align.min(class), 0);
        if let Some(smaller) = index.checked_sub(1).map(|i| SIZE_CLASSES[i]) {
            prop_assert!(smaller < size || smaller % align != 0);
        }
    }
}
