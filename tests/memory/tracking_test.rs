/*!
 * Tracking Tests
 * Leak detection, corruption accounting and health reporting
 */

use memory_core::memory::numa::NumaTopology;
use memory_core::{AllocationStrategy, ManagerConfig, MemoryError, MemoryManager, MemoryPolicy};
use pretty_assertions::assert_eq;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn manager() -> MemoryManager {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    MemoryManager::new(config).unwrap()
}

#[test]
fn test_balanced_pairs_leave_no_leaks() {
    let mgr = manager();
    let policy = MemoryPolicy::default().with_tag("pairs");

    for k in 0..500usize {
        let size = 8 + (k % 64) * 24;
        let ptr = mgr.allocate(size, &policy).unwrap();
        mgr.deallocate(ptr, size, &policy).unwrap();
    }

    assert!(mgr.detect_leaks().is_empty());
    let stats = mgr.allocation_statistics();
    assert_eq!(stats.total_allocations, 500);
    assert_eq!(stats.total_deallocations, 500);
    assert_eq!(stats.current_bytes, 0);
}

#[test]
fn test_single_missing_free_is_reported() {
    let mgr = manager();
    let policy = MemoryPolicy::default().with_tag("Leaky");

    let blocks: Vec<NonNull<u8>> = (0..10).map(|_| mgr.allocate(48, &policy).unwrap()).collect();
    let (kept, freed) = blocks.split_at(1);
    for &ptr in freed {
        mgr.deallocate(ptr, 48, &policy).unwrap();
    }

    let leaks = mgr.detect_leaks();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].tag.as_str(), "Leaky");
    assert_eq!(leaks[0].size, 48);
    assert_eq!(leaks[0].address, kept[0].as_ptr() as usize);
    assert_eq!(mgr.tracker().get_leaks().len(), 1);
}

#[test]
fn test_outstanding_blocks_without_leak_checking() {
    let mgr = manager();
    let policy = MemoryPolicy::default()
        .with_tag("Test")
        .with_leak_detection(false);

    let blocks: Vec<NonNull<u8>> = (0..100).map(|_| mgr.allocate(64, &policy).unwrap()).collect();
    for &ptr in &blocks[..50] {
        mgr.deallocate(ptr, 64, &policy).unwrap();
    }

    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 50 * 64);
    assert!(mgr.detect_leaks().is_empty());

    let live = mgr.live_allocations();
    assert_eq!(live.len(), 50);
    assert!(live.iter().all(|record| record.tag.as_str() == "Test" && record.size == 64));

    let usage = mgr.tag_usage();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].live_allocations, 50);
    assert_eq!(usage[0].live_bytes, 50 * 64);

    for &ptr in &blocks[50..] {
        mgr.deallocate(ptr, 64, &policy).unwrap();
    }
    assert!(mgr.live_allocations().is_empty());
}

#[test]
fn test_leak_age_filter() {
    let mgr = manager();
    let policy = MemoryPolicy::default();

    let old = mgr.allocate(32, &policy).unwrap();
    thread::sleep(Duration::from_millis(30));
    let young = mgr.allocate(32, &policy).unwrap();

    let aged = mgr.detect_leaks_older_than(Duration::from_millis(20));
    assert_eq!(aged.len(), 1);
    assert_eq!(aged[0].address, old.as_ptr() as usize);
    assert_eq!(mgr.detect_leaks().len(), 2);

    mgr.deallocate(old, 32, &policy).unwrap();
    mgr.deallocate(young, 32, &policy).unwrap();
}

#[test]
fn test_double_free_is_corruption() {
    let mgr = manager();
    let policy = MemoryPolicy::default();

    let ptr = mgr.allocate(128, &policy).unwrap();
    let address = ptr.as_ptr() as usize;
    mgr.deallocate(ptr, 128, &policy).unwrap();

    let err = mgr.deallocate(ptr, 128, &policy).unwrap_err();
    assert!(matches!(err, MemoryError::DoubleFree(a) if a == address));
    assert!(err.is_corruption());

    // Live bytes are not decremented twice
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);

    let report = mgr.corruption_report();
    assert_eq!(report.double_frees, 1);
    assert_eq!(report.recent_addresses, vec![address]);

    let health = mgr.generate_health_report();
    assert!(health.has_memory_corruption);
    assert_eq!(health.double_frees, 1);
    assert!(!health.is_healthy());
}

#[test]
fn test_foreign_pointer_is_rejected() {
    let mgr = manager();
    let mut local = [0u64; 4];
    let ptr = NonNull::from(&mut local).cast::<u8>();

    let err = mgr.deallocate(ptr, 32, &MemoryPolicy::default()).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignPointer { .. }));
    assert_eq!(mgr.corruption_report().invalid_frees, 1);
    assert_eq!(local, [0u64; 4]);
}

#[test]
fn test_health_report_names_leaking_tag() {
    let mgr = manager();
    let small = MemoryPolicy::default().with_tag("small");
    let big = MemoryPolicy::default().with_tag("textures");

    let a = mgr.allocate(32, &small).unwrap();
    let b = mgr.allocate(2048, &big).unwrap();

    let report = mgr.generate_health_report();
    assert!(report.has_memory_leaks);
    assert_eq!(report.leaked_allocations, 2);
    assert_eq!(report.leaked_bytes, 2080);
    assert!(report
        .recommendations
        .iter()
        .any(|line| line.contains("textures")));

    mgr.deallocate(a, 32, &small).unwrap();
    mgr.deallocate(b, 2048, &big).unwrap();
    assert!(mgr.generate_health_report().is_healthy());
}

#[test]
fn test_stack_traces_are_captured_on_request() {
    let mgr = manager();
    let plain = MemoryPolicy::default();
    let traced = MemoryPolicy::default().with_stack_traces(true);

    let a = mgr.allocate(64, &plain).unwrap();
    let b = mgr.allocate(64, &traced).unwrap();

    let record_a = mgr.tracker().lookup(a.as_ptr() as usize).unwrap();
    let record_b = mgr.tracker().lookup(b.as_ptr() as usize).unwrap();
    assert!(record_a.backtrace.is_none());
    assert!(record_b.backtrace.is_some());

    mgr.deallocate(a, 64, &plain).unwrap();
    mgr.deallocate(b, 64, &traced).unwrap();
}

#[test]
fn test_record_describes_the_serving_allocator() {
    let mgr = manager();
    let policy = MemoryPolicy::default()
        .with_strategy(AllocationStrategy::ThreadLocal)
        .with_tag("cache");

    let ptr = mgr.allocate(40, &policy).unwrap();
    let record = mgr.tracker().lookup(ptr.as_ptr() as usize).unwrap();
    assert_eq!(record.size, 40);
    assert_eq!(record.strategy, AllocationStrategy::ThreadLocal);
    assert_eq!(record.tag.as_str(), "cache");
    assert_eq!(record.thread, thread::current().id());

    mgr.deallocate(ptr, 40, &policy).unwrap();
    assert!(!mgr.tracker().is_tracked(ptr.as_ptr() as usize));
}

#[test]
fn test_reset_statistics_keeps_live_state() {
    let mgr = manager();
    let policy = MemoryPolicy::default();

    let kept = mgr.allocate(256, &policy).unwrap();
    let freed = mgr.allocate(256, &policy).unwrap();
    mgr.deallocate(freed, 256, &policy).unwrap();
    let _ = mgr.deallocate(freed, 256, &policy);

    mgr.reset_statistics();

    let metrics = mgr.get_performance_metrics();
    assert_eq!(metrics.total_allocations, 0);
    assert_eq!(metrics.current_allocated_bytes, 256);
    assert_eq!(metrics.peak_allocated_bytes, 256);
    assert_eq!(mgr.corruption_report().double_frees, 0);
    assert_eq!(mgr.live_allocations().len(), 1);

    mgr.deallocate(kept, 256, &policy).unwrap();
    assert_eq!(mgr.get_performance_metrics().current_allocated_bytes, 0);
}
