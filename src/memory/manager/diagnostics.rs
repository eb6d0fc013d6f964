/*!
 * Diagnostics
 * Metrics snapshots, health reports, profile export and maintenance
 */

use super::MemoryManager;
use crate::core::errors::MemoryResult;
use crate::core::limits::{
    EFFICIENCY_MIN_RESERVED, HIGH_FAILURE_RATIO, HIGH_FALLBACK_RATIO, LOCKFREE_BLOCK_SIZE,
    LOW_EFFICIENCY_RATIO, LOW_POOL_UTILIZATION,
};
use crate::core::types::{Size, Tag};
use crate::memory::numa::NodeUsage;
use crate::memory::pressure::CallbackId;
use crate::memory::tracker::{
    export_profile, AllocationRecord, AllocationStatistics, CorruptionReport, ProfileFormat,
    TagUsage,
};
use crate::memory::traits::BlockAllocator;
use crate::memory::types::{
    HealthReport, PerformanceMetrics, PoolStats, PoolUtilization, PressureLevel,
};
use crate::monitoring::span_operation;
use ahash::{HashMap, HashMapExt};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, instrument, warn};

fn utilization_entry(name: String, stats: &PoolStats) -> PoolUtilization {
    PoolUtilization {
        name,
        slot_size: stats.slot_size,
        capacity: stats.capacity,
        used: stats.used,
        utilization: stats.utilization(),
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl MemoryManager {
    /// Point-in-time metrics; counters are read independently
    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        let builtins: [&dyn BlockAllocator; 7] = [
            &self.linear,
            &self.lockfree,
            &self.segregated,
            &self.thread_local,
            &self.numa,
            &self.heap,
            &self.system,
        ];
        let custom = self.custom_pool_stats();
        let reserved_bytes: Size = builtins.iter().map(|a| a.usage().used).sum::<Size>()
            + custom
                .iter()
                .map(|(_, stats)| stats.used * stats.slot_size)
                .sum::<Size>();

        let current = self.counters.current();
        let memory_efficiency = if reserved_bytes == 0 {
            1.0
        } else {
            (current as f64 / reserved_bytes as f64).min(1.0)
        };

        let lockfree_usage = self.lockfree.usage();
        let mut pools: Vec<PoolUtilization> = self
            .segregated
            .class_stats()
            .iter()
            .map(|stats| utilization_entry(format!("size_class_{}", stats.slot_size), stats))
            .collect();
        pools.push(PoolUtilization {
            name: format!("lockfree_{LOCKFREE_BLOCK_SIZE}"),
            slot_size: LOCKFREE_BLOCK_SIZE,
            capacity: self.lockfree.capacity(),
            used: lockfree_usage.live_blocks,
            utilization: lockfree_usage.utilization(),
        });
        pools.extend(
            custom
                .iter()
                .map(|(name, stats)| utilization_entry(name.clone(), stats)),
        );

        let active: Vec<&PoolUtilization> = pools.iter().filter(|p| p.used > 0).collect();
        let average_pool_utilization = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|p| p.utilization).sum::<f64>() / active.len() as f64
        };

        let bandwidth = self.bandwidth.stats();
        PerformanceMetrics {
            total_allocations: self.counters.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.counters.total_deallocations.load(Ordering::Relaxed),
            failed_allocations: self.counters.failed_allocations.load(Ordering::Relaxed),
            fallback_allocations: self.counters.fallback_allocations.load(Ordering::Relaxed),
            zero_size_allocations: self.counters.zero_size_allocations.load(Ordering::Relaxed),
            total_allocated_bytes: self.counters.total_allocated_bytes.load(Ordering::Relaxed),
            current_allocated_bytes: current,
            peak_allocated_bytes: self.counters.peak(),
            reserved_bytes,
            memory_efficiency,
            current_read_bandwidth_mbps: bandwidth.current_read_mbps,
            current_write_bandwidth_mbps: bandwidth.current_write_mbps,
            peak_read_bandwidth_mbps: bandwidth.peak_read_mbps,
            peak_write_bandwidth_mbps: bandwidth.peak_write_mbps,
            active_pools: active.len(),
            average_pool_utilization,
            pool_utilization: pools,
            numa_node_utilization: self
                .numa
                .node_usage()
                .into_iter()
                .map(|usage| (usage.node, usage.utilization))
                .collect(),
            current_pressure: self.pressure.level(),
            strategy_counts: self.counters.strategy_counts(),
        }
    }

    /// Leak, corruption and performance diagnosis.
    ///
    /// Walks every live record; not meant for hot paths.
    #[instrument(skip(self))]
    pub fn generate_health_report(&self) -> HealthReport {
        let leaks = self.tracker.detect_leaks();
        let corruption = self.tracker.corruption_report();
        let metrics = self.get_performance_metrics();

        let mut report = HealthReport {
            has_memory_leaks: !leaks.is_empty(),
            leaked_allocations: leaks.len(),
            leaked_bytes: leaks.iter().map(|record| record.size).sum(),
            has_memory_corruption: corruption.has_corruption(),
            double_frees: corruption.double_frees,
            invalid_frees: corruption.invalid_frees,
            ..HealthReport::default()
        };

        if report.has_memory_leaks {
            report.warnings.push(format!(
                "{} allocations ({} bytes) are still live",
                report.leaked_allocations, report.leaked_bytes
            ));
            if let Some((tag, bytes)) = largest_tag(&leaks) {
                report.recommendations.push(format!(
                    "Release allocations tagged '{tag}' ({bytes} bytes outstanding) or hold them in a ManagedBox"
                ));
            }
        }

        if report.has_memory_corruption {
            report.warnings.push(format!(
                "{} double frees and {} invalid frees detected",
                corruption.double_frees, corruption.invalid_frees
            ));
            report.recommendations.push(
                "Audit ownership of the reported addresses; enable tracking on the policies involved"
                    .to_string(),
            );
        }

        let attempts = metrics.total_allocations + metrics.failed_allocations;
        let failure_ratio = ratio(metrics.failed_allocations, attempts);
        if failure_ratio > HIGH_FAILURE_RATIO {
            report.has_performance_issues = true;
            report.recommendations.push(format!(
                "{:.1}% of allocation requests failed; raise heap capacity or the hard limit",
                failure_ratio * 100.0
            ));
        }

        let fallback_ratio = ratio(metrics.fallback_allocations, metrics.total_allocations);
        if fallback_ratio > HIGH_FALLBACK_RATIO {
            report.has_performance_issues = true;
            report.recommendations.push(format!(
                "{:.1}% of allocations fell back from their preferred allocator; enlarge the pools behind the strategies in use",
                fallback_ratio * 100.0
            ));
        }

        if metrics.reserved_bytes >= EFFICIENCY_MIN_RESERVED
            && metrics.memory_efficiency < LOW_EFFICIENCY_RATIO
        {
            report.has_performance_issues = true;
            report.recommendations.push(format!(
                "Memory efficiency is {:.0}%; prefer MostEfficient for small objects and let the linear arena drain",
                metrics.memory_efficiency * 100.0
            ));
        }

        if metrics.current_pressure >= PressureLevel::High {
            report.has_performance_issues = true;
            report
                .warnings
                .push(format!("Memory pressure is {}", metrics.current_pressure));
            report.recommendations.push(
                "Register pressure callbacks that release caches, or raise the memory budget"
                    .to_string(),
            );
        }

        for (name, stats) in self.custom_pool_stats() {
            if stats.used > 0 && stats.utilization() < LOW_POOL_UTILIZATION {
                report.recommendations.push(format!(
                    "Custom pool '{name}' is {:.0}% utilized; reduce its capacity",
                    stats.utilization() * 100.0
                ));
            }
        }

        info!(
            healthy = report.is_healthy(),
            leaks = report.leaked_allocations,
            double_frees = report.double_frees,
            invalid_frees = report.invalid_frees,
            "Generated memory health report"
        );
        report
    }

    /// Write live tracked allocations to `path` as tab-separated text
    pub fn export_allocation_profile(&self, path: impl AsRef<Path>) -> MemoryResult<usize> {
        self.export_allocation_profile_as(path, ProfileFormat::Text)
    }

    #[instrument(skip(self, path))]
    pub fn export_allocation_profile_as(
        &self,
        path: impl AsRef<Path>,
        format: ProfileFormat,
    ) -> MemoryResult<usize> {
        let path = path.as_ref();
        let span = span_operation("export_allocation_profile");
        let _guard = span.enter();

        let records = self.tracker.live_allocations();
        let result = export_profile(path, &records, format);
        span.record_result(result.is_ok());
        match &result {
            Ok(written) => info!(
                records = written,
                path = %path.display(),
                ?format,
                "Exported allocation profile"
            ),
            Err(e) => warn!(error = %e, "Allocation profile export failed"),
        }
        result
    }

    /// Live records created under a leak-checking policy
    pub fn detect_leaks(&self) -> Vec<AllocationRecord> {
        self.tracker.detect_leaks()
    }

    pub fn detect_leaks_older_than(&self, min_age: Duration) -> Vec<AllocationRecord> {
        self.tracker.detect_leaks_older_than(min_age)
    }

    pub fn live_allocations(&self) -> Vec<AllocationRecord> {
        self.tracker.live_allocations()
    }

    pub fn tag_usage(&self) -> Vec<TagUsage> {
        self.tracker.tag_usage()
    }

    pub fn corruption_report(&self) -> CorruptionReport {
        self.tracker.corruption_report()
    }

    pub fn allocation_statistics(&self) -> AllocationStatistics {
        self.tracker.statistics()
    }

    pub fn numa_node_usage(&self) -> Vec<NodeUsage> {
        self.numa.node_usage()
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.pressure.level()
    }

    pub fn register_pressure_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(PressureLevel) -> Size + Send + Sync + 'static,
    {
        self.pressure.register(callback)
    }

    pub fn unregister_pressure_callback(&self, id: CallbackId) -> bool {
        self.pressure.unregister(id)
    }

    /// Zero counters, corruption history and bandwidth samples.
    /// Live bytes and live records are kept.
    pub fn reset_statistics(&self) {
        self.counters.reset();
        self.tracker.reset_statistics();
        self.bandwidth.reset();
        info!("Memory statistics reset");
    }

    /// Run every relief action now, returning bytes released
    pub fn trim(&self) -> Size {
        let span = span_operation("trim");
        let _guard = span.enter();
        let freed = self.relieve(PressureLevel::Critical);
        info!(freed, "Memory trim complete");
        freed
    }
}

/// Tag holding the most leaked bytes
fn largest_tag(records: &[AllocationRecord]) -> Option<(Tag, Size)> {
    let mut totals: HashMap<&Tag, Size> = HashMap::new();
    for record in records {
        *totals.entry(&record.tag).or_insert(0) += record.size;
    }
    totals
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(tag, bytes)| (tag.clone(), bytes))
}
