/*!
 * Allocation Tracking
 *
 * Records metadata for every tracked allocation and detects misuse:
 * - **Live records**: address → record, sharded for concurrent access
 * - **Retired records**: bounded history of freed addresses, so a second
 *   free of the same address is reported as a double free rather than an
 *   unknown pointer
 * - **Leak detection**: live records created under a leak-checking policy
 */

mod bandwidth;
mod export;
mod record;

pub use bandwidth::{BandwidthMonitor, BandwidthSample, BandwidthStats};
pub use export::{export_profile, write_profile, ProfileFormat, TEXT_HEADER};
pub use record::AllocationRecord;

use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{
    INVALID_FREE_HISTORY, MEDIUM_BLOCK_MAX, RETIRED_RECORD_CAPACITY, TRACKER_SMALL_MAX,
};
use crate::core::types::{Address, Size, Tag};
use ahash::{HashMap, HashMapExt, RandomState};
use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Aggregate counters over everything the tracker has seen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationStatistics {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub total_bytes_allocated: u64,
    pub total_bytes_freed: u64,
    pub current_allocations: usize,
    pub peak_allocations: usize,
    pub current_bytes: Size,
    pub peak_bytes: Size,
    /// Up to 256 bytes
    pub small_allocations: u64,
    /// Up to 64 KB
    pub medium_allocations: u64,
    pub large_allocations: u64,
    pub unique_threads: usize,
}

/// Misuse seen by the tracker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorruptionReport {
    pub double_frees: u64,
    pub invalid_frees: u64,
    /// Most recent offending addresses, oldest first
    pub recent_addresses: Vec<Address>,
}

impl CorruptionReport {
    pub fn has_corruption(&self) -> bool {
        self.double_frees > 0 || self.invalid_frees > 0
    }
}

/// Live usage aggregated per allocation tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagUsage {
    pub tag: Tag,
    pub live_allocations: usize,
    pub live_bytes: Size,
}

/// Concurrent allocation tracker
pub struct MemoryTracker {
    live: DashMap<Address, AllocationRecord, RandomState>,
    retired: DashMap<Address, AllocationRecord, RandomState>,
    retired_order: Mutex<VecDeque<(Address, Option<Instant>)>>,
    retired_capacity: usize,
    threads: DashSet<ThreadId, RandomState>,
    recent_misuse: Mutex<VecDeque<Address>>,
    last_leaks: ArcSwap<Vec<AllocationRecord>>,

    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
    total_bytes_allocated: AtomicU64,
    total_bytes_freed: AtomicU64,
    current_allocations: AtomicUsize,
    peak_allocations: AtomicUsize,
    current_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    small_allocations: AtomicU64,
    medium_allocations: AtomicU64,
    large_allocations: AtomicU64,
    double_frees: AtomicU64,
    invalid_frees: AtomicU64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::with_retired_capacity(RETIRED_RECORD_CAPACITY)
    }

    /// Tracker remembering at most `retired_capacity` freed addresses
    pub fn with_retired_capacity(retired_capacity: usize) -> Self {
        Self {
            live: DashMap::with_hasher(RandomState::new()),
            retired: DashMap::with_hasher(RandomState::new()),
            retired_order: Mutex::new(VecDeque::with_capacity(retired_capacity)),
            retired_capacity,
            threads: DashSet::with_hasher(RandomState::new()),
            recent_misuse: Mutex::new(VecDeque::with_capacity(INVALID_FREE_HISTORY)),
            last_leaks: ArcSwap::from_pointee(Vec::new()),
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
            total_bytes_allocated: AtomicU64::new(0),
            total_bytes_freed: AtomicU64::new(0),
            current_allocations: AtomicUsize::new(0),
            peak_allocations: AtomicUsize::new(0),
            current_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            small_allocations: AtomicU64::new(0),
            medium_allocations: AtomicU64::new(0),
            large_allocations: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
        }
    }

    /// Start tracking a fresh allocation
    pub fn track(&self, record: AllocationRecord) {
        let address = record.address;
        let size = record.size;

        // Address reuse: the old retired entry no longer describes this block
        self.retired.remove(&address);
        self.threads.insert(record.thread);

        if let Some(stale) = self.live.insert(address, record) {
            // The block was released without going through the tracker
            self.current_bytes.fetch_sub(stale.size, Ordering::Relaxed);
            self.current_allocations.fetch_sub(1, Ordering::Relaxed);
            debug!(address = format_args!("0x{:x}", address), "Replaced stale record");
        }

        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        let count = self.current_allocations.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_allocations.fetch_max(count, Ordering::Relaxed);
        let bytes = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);

        let bucket = match size {
            0..=TRACKER_SMALL_MAX => &self.small_allocations,
            s if s <= MEDIUM_BLOCK_MAX => &self.medium_allocations,
            _ => &self.large_allocations,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop tracking `address`, returning its record.
    ///
    /// A recently freed address yields `DoubleFree`; anything else unknown
    /// yields `InvalidFree`. Both are counted as corruption.
    pub fn untrack(&self, address: Address) -> MemoryResult<AllocationRecord> {
        if let Some(record) = self.take(address) {
            return Ok(record);
        }

        if self.is_retired(address) {
            self.record_double_free(address);
            Err(MemoryError::DoubleFree(address))
        } else {
            self.record_invalid_free(address);
            Err(MemoryError::InvalidFree(address))
        }
    }

    /// Remove the live record for `address` if there is one, without
    /// treating its absence as misuse
    pub fn take(&self, address: Address) -> Option<AllocationRecord> {
        let (_, mut record) = self.live.remove(&address)?;
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_freed
            .fetch_add(record.size as u64, Ordering::Relaxed);
        self.current_allocations.fetch_sub(1, Ordering::Relaxed);
        self.current_bytes.fetch_sub(record.size, Ordering::Relaxed);

        record.freed_at = Some(Instant::now());
        self.retire(record.clone());
        Some(record)
    }

    /// Whether `address` was freed recently and not reused since
    pub fn is_retired(&self, address: Address) -> bool {
        !self.live.contains_key(&address) && self.retired.contains_key(&address)
    }

    fn retire(&self, record: AllocationRecord) {
        if self.retired_capacity == 0 {
            return;
        }
        let key = (record.address, record.freed_at);
        let mut order = self.retired_order.lock();
        self.retired.insert(record.address, record);
        order.push_back(key);
        while order.len() > self.retired_capacity {
            if let Some((oldest, freed_at)) = order.pop_front() {
                // The address may have been retired again since
                self.retired
                    .remove_if(&oldest, |_, record| record.freed_at == freed_at);
            }
        }
    }

    /// Count a double free detected outside the tracker (e.g. by an allocator)
    pub fn record_double_free(&self, address: Address) {
        self.double_frees.fetch_add(1, Ordering::Relaxed);
        self.remember_misuse(address);
        warn!(address = format_args!("0x{:x}", address), "Double free detected");
    }

    /// Count a free of memory this process never handed out
    pub fn record_invalid_free(&self, address: Address) {
        self.invalid_frees.fetch_add(1, Ordering::Relaxed);
        self.remember_misuse(address);
        warn!(address = format_args!("0x{:x}", address), "Invalid free detected");
    }

    fn remember_misuse(&self, address: Address) {
        let mut recent = self.recent_misuse.lock();
        if recent.len() == INVALID_FREE_HISTORY {
            recent.pop_front();
        }
        recent.push_back(address);
    }

    pub fn is_tracked(&self, address: Address) -> bool {
        self.live.contains_key(&address)
    }

    pub fn lookup(&self, address: Address) -> Option<AllocationRecord> {
        self.live.get(&address).map(|entry| entry.value().clone())
    }

    /// Requested size of a live tracked block
    pub fn size_of(&self, address: Address) -> Option<Size> {
        self.live.get(&address).map(|entry| entry.size)
    }

    /// Live records created with leak detection enabled, oldest first.
    /// The result is also kept for `get_leaks`.
    pub fn detect_leaks(&self) -> Vec<AllocationRecord> {
        self.collect_leaks(Duration::ZERO)
    }

    /// Like `detect_leaks`, restricted to records at least `min_age` old
    pub fn detect_leaks_older_than(&self, min_age: Duration) -> Vec<AllocationRecord> {
        self.collect_leaks(min_age)
    }

    fn collect_leaks(&self, min_age: Duration) -> Vec<AllocationRecord> {
        let mut leaks: Vec<AllocationRecord> = self
            .live
            .iter()
            .filter(|entry| entry.leak_checked && entry.age() >= min_age)
            .map(|entry| entry.value().clone())
            .collect();
        leaks.sort_by_key(|record| (record.created_at, record.address));

        if !leaks.is_empty() {
            debug!(count = leaks.len(), "Leak scan found live allocations");
        }
        self.last_leaks.store(Arc::new(leaks.clone()));
        leaks
    }

    /// Result of the most recent leak scan
    pub fn get_leaks(&self) -> Arc<Vec<AllocationRecord>> {
        self.last_leaks.load_full()
    }

    /// Every live record, oldest first
    pub fn live_allocations(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<AllocationRecord> =
            self.live.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| (record.created_at, record.address));
        records
    }

    pub fn live_count(&self) -> usize {
        self.current_allocations.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> Size {
        self.current_bytes.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> AllocationStatistics {
        AllocationStatistics {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            total_bytes_allocated: self.total_bytes_allocated.load(Ordering::Relaxed),
            total_bytes_freed: self.total_bytes_freed.load(Ordering::Relaxed),
            current_allocations: self.current_allocations.load(Ordering::Relaxed),
            peak_allocations: self.peak_allocations.load(Ordering::Relaxed),
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            small_allocations: self.small_allocations.load(Ordering::Relaxed),
            medium_allocations: self.medium_allocations.load(Ordering::Relaxed),
            large_allocations: self.large_allocations.load(Ordering::Relaxed),
            unique_threads: self.threads.len(),
        }
    }

    pub fn corruption_report(&self) -> CorruptionReport {
        CorruptionReport {
            double_frees: self.double_frees.load(Ordering::Relaxed),
            invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
            recent_addresses: self.recent_misuse.lock().iter().copied().collect(),
        }
    }

    /// Live usage grouped by tag, largest first
    pub fn tag_usage(&self) -> Vec<TagUsage> {
        let mut totals: HashMap<Tag, (usize, Size)> = HashMap::new();
        for entry in self.live.iter() {
            let slot = totals.entry(entry.tag.clone()).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += entry.size;
        }

        let mut usage: Vec<TagUsage> = totals
            .into_iter()
            .map(|(tag, (live_allocations, live_bytes))| TagUsage {
                tag,
                live_allocations,
                live_bytes,
            })
            .collect();
        usage.sort_by(|a, b| b.live_bytes.cmp(&a.live_bytes).then(a.tag.cmp(&b.tag)));
        usage
    }

    /// Zero the counters and forget retired history and misuse.
    /// Live records stay: the blocks they describe are still allocated.
    pub fn reset_statistics(&self) {
        self.retired.clear();
        self.retired_order.lock().clear();
        self.recent_misuse.lock().clear();
        self.threads.clear();
        self.last_leaks.store(Arc::new(Vec::new()));

        self.total_allocations.store(0, Ordering::Relaxed);
        self.total_deallocations.store(0, Ordering::Relaxed);
        self.total_bytes_allocated.store(0, Ordering::Relaxed);
        self.total_bytes_freed.store(0, Ordering::Relaxed);
        self.small_allocations.store(0, Ordering::Relaxed);
        self.medium_allocations.store(0, Ordering::Relaxed);
        self.large_allocations.store(0, Ordering::Relaxed);
        self.double_frees.store(0, Ordering::Relaxed);
        self.invalid_frees.store(0, Ordering::Relaxed);

        let count = self.current_allocations.load(Ordering::Relaxed);
        let bytes = self.current_bytes.load(Ordering::Relaxed);
        self.peak_allocations.store(count, Ordering::Relaxed);
        self.peak_bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryTracker {
    /// Forget everything, live records included
    pub fn reset(&self) {
        self.live.clear();
        self.current_allocations.store(0, Ordering::Relaxed);
        self.current_bytes.store(0, Ordering::Relaxed);
        self.reset_statistics();
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("live", &self.live.len())
            .field("retired", &self.retired.len())
            .field("double_frees", &self.double_frees.load(Ordering::Relaxed))
            .field("invalid_frees", &self.invalid_frees.load(Ordering::Relaxed))
            .finish()
    }
}
