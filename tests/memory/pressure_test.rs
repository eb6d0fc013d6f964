/*!
 * Pressure Tests
 * Level transitions, callbacks and automatic relief
 */

use memory_core::memory::numa::NumaTopology;
use memory_core::memory::{PressureDetector, PressureThresholds};
use memory_core::{
    AllocationStrategy, ManagerConfig, MemoryError, MemoryManager, MemoryPolicy, PressureLevel,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_callbacks_fire_only_on_escalation() {
    let detector = PressureDetector::new(1000).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    detector.register(move |level| {
        log.lock().push(level);
        0
    });

    detector.update(100);
    detector.update(600);
    detector.update(800);
    detector.update(200);
    detector.update(950);
    detector.update(960);

    assert_eq!(
        *seen.lock(),
        vec![
            PressureLevel::Moderate,
            PressureLevel::High,
            PressureLevel::Critical
        ]
    );
    assert_eq!(detector.level(), PressureLevel::Critical);
    assert_eq!(detector.escalations(), 3);
}

#[test]
fn test_unregistered_callback_stops_firing() {
    let detector = PressureDetector::new(1000).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let id = detector.register(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        64
    });

    detector.update(700);
    assert!(detector.unregister(id));
    assert!(!detector.unregister(id));
    detector.update(0);
    detector.update(990);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(detector.bytes_reclaimed(), 64);
    assert_eq!(detector.callback_count(), 0);
}

#[test]
fn test_update_reports_transitions() {
    let detector = PressureDetector::new(1000).unwrap();

    let change = detector.update(760).unwrap();
    assert_eq!(change.previous, PressureLevel::Low);
    assert_eq!(change.current, PressureLevel::High);
    assert!(change.is_escalation());

    assert!(detector.update(800).is_none());

    let change = detector.update(10).unwrap();
    assert!(!change.is_escalation());
    assert_eq!(detector.level(), PressureLevel::Low);
}

#[test]
fn test_budget_change_recomputes_level() {
    let detector = PressureDetector::new(1000).unwrap();
    detector.update(400);
    assert_eq!(detector.level(), PressureLevel::Low);

    let change = detector.set_budget(700).unwrap().unwrap();
    assert_eq!(change.current, PressureLevel::Moderate);
    assert!(detector.set_budget(700).unwrap().is_none());
    assert!(matches!(
        detector.set_budget(0),
        Err(MemoryError::InvalidConfig(_))
    ));
}

#[test]
fn test_thresholds_must_be_ordered() {
    let inverted = PressureThresholds {
        moderate: 0.9,
        high: 0.5,
        critical: 0.95,
    };
    assert!(PressureDetector::with_thresholds(1000, inverted).is_err());

    let custom = PressureThresholds {
        moderate: 0.2,
        high: 0.4,
        critical: 0.6,
    };
    let detector = PressureDetector::with_thresholds(1000, custom).unwrap();
    detector.update(450);
    assert_eq!(detector.level(), PressureLevel::High);
}

#[test]
fn test_manager_drives_its_detector() {
    let config = ManagerConfig::compact()
        .with_numa_topology(Arc::new(NumaTopology::single_node()))
        .with_memory_budget(64 * 1024);
    let mgr = MemoryManager::new(config).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    mgr.register_pressure_callback(move |level| {
        log.lock().push(level);
        0
    });

    let policy = MemoryPolicy::performance(AllocationStrategy::Balanced);
    let blocks: Vec<NonNull<u8>> = (0..7)
        .map(|_| mgr.allocate(8 * 1024, &policy).unwrap())
        .collect();

    // 56 KB of a 64 KB budget
    assert_eq!(mgr.pressure_level(), PressureLevel::High);
    assert_eq!(
        *seen.lock(),
        vec![PressureLevel::Moderate, PressureLevel::High]
    );
    assert_eq!(
        mgr.get_performance_metrics().current_pressure,
        PressureLevel::High
    );
    assert!(mgr
        .generate_health_report()
        .warnings
        .iter()
        .any(|warning| warning.contains("HIGH")));

    for ptr in blocks {
        mgr.deallocate(ptr, 8 * 1024, &policy).unwrap();
    }
    assert_eq!(mgr.pressure_level(), PressureLevel::Low);
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_high_pressure_balanced_prefers_heap() {
    let detector = Arc::new(PressureDetector::new(1000).unwrap());
    let config = ManagerConfig::compact()
        .with_numa_topology(Arc::new(NumaTopology::single_node()))
        .with_pressure_detector(Arc::clone(&detector));
    let mgr = MemoryManager::new(config).unwrap();
    let policy = MemoryPolicy::default();

    let pooled = mgr.allocate(64, &policy).unwrap();
    let record = mgr.tracker().lookup(pooled.as_ptr() as usize).unwrap();
    assert_eq!(record.source.as_str(), "segregated pools");

    // The shared detector now sees the manager over budget
    let big = mgr.allocate(2000, &policy).unwrap();
    assert!(detector.level() >= PressureLevel::High);

    let heaped = mgr.allocate(64, &policy).unwrap();
    let record = mgr.tracker().lookup(heaped.as_ptr() as usize).unwrap();
    assert_eq!(record.source.as_str(), "general heap");

    for (ptr, size) in [(pooled, 64), (big, 2000), (heaped, 64)] {
        mgr.deallocate(ptr, size, &policy).unwrap();
    }
}

#[test]
fn test_callback_may_allocate_without_recursing() {
    let config = ManagerConfig::compact()
        .with_numa_topology(Arc::new(NumaTopology::single_node()))
        .with_memory_budget(4096);
    let mgr = Arc::new(MemoryManager::new(config).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let inner = Arc::downgrade(&mgr);
    let counter = Arc::clone(&calls);
    mgr.register_pressure_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(mgr) = inner.upgrade() {
            let policy = MemoryPolicy::performance(AllocationStrategy::Balanced);
            // Pushes usage further up from inside the callback
            if let Some(ptr) = mgr.allocate(1024, &policy) {
                let _ = mgr.deallocate(ptr, 1024, &policy);
            }
        }
        0
    });

    let policy = MemoryPolicy::performance(AllocationStrategy::Balanced);
    let ptr = mgr.allocate(3000, &policy).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    mgr.deallocate(ptr, 3000, &policy).unwrap();
}
