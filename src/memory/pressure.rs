/*!
 * Memory Pressure Detection
 *
 * Maps current usage against a byte budget onto four levels and notifies
 * registered callbacks when the level rises. Callbacks run on the thread that
 * caused the transition, with no detector lock held, and report how many
 * bytes they released.
 */

use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::limits::{
    DEFAULT_MEMORY_BUDGET, PRESSURE_CRITICAL_RATIO, PRESSURE_HIGH_RATIO,
    PRESSURE_MODERATE_RATIO,
};
use crate::core::types::Size;
use crate::memory::types::PressureLevel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

pub type CallbackId = u64;

/// Invoked with the new level; returns bytes released
pub type PressureCallback = Arc<dyn Fn(PressureLevel) -> Size + Send + Sync>;

/// Usage ratios at which each level begins
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            moderate: PRESSURE_MODERATE_RATIO,
            high: PRESSURE_HIGH_RATIO,
            critical: PRESSURE_CRITICAL_RATIO,
        }
    }
}

impl PressureThresholds {
    pub fn validate(&self) -> MemoryResult<()> {
        let ordered =
            0.0 < self.moderate && self.moderate <= self.high && self.high <= self.critical;
        if !ordered || !self.critical.is_finite() {
            return Err(MemoryError::InvalidConfig(format!(
                "pressure thresholds must satisfy 0 < moderate <= high <= critical, got {} / {} / {}",
                self.moderate, self.high, self.critical
            )));
        }
        Ok(())
    }

    pub fn level_for(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.critical {
            PressureLevel::Critical
        } else if ratio >= self.high {
            PressureLevel::High
        } else if ratio >= self.moderate {
            PressureLevel::Moderate
        } else {
            PressureLevel::Low
        }
    }
}

/// Level change produced by an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureChange {
    pub previous: PressureLevel,
    pub current: PressureLevel,
}

impl PressureChange {
    pub fn is_escalation(&self) -> bool {
        self.current > self.previous
    }
}

static NEXT_DETECTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Detectors whose callbacks are running on this thread
    static DISPATCHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks one detector as dispatching; cleared even if a callback panics
struct DispatchGuard {
    detector: u64,
}

impl DispatchGuard {
    fn enter(detector: u64) -> Option<Self> {
        DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&detector) {
                None
            } else {
                active.push(detector);
                Some(DispatchGuard { detector })
            }
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|active| active.borrow_mut().retain(|id| *id != self.detector));
    }
}

pub struct PressureDetector {
    id: u64,
    budget: AtomicUsize,
    thresholds: PressureThresholds,
    level: AtomicU8,
    last_usage: AtomicUsize,
    callbacks: RwLock<Vec<(CallbackId, PressureCallback)>>,
    next_id: AtomicU64,
    escalations: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

impl PressureDetector {
    pub fn new(budget: Size) -> MemoryResult<Self> {
        Self::with_thresholds(budget, PressureThresholds::default())
    }

    pub fn with_thresholds(budget: Size, thresholds: PressureThresholds) -> MemoryResult<Self> {
        if budget == 0 {
            return Err(MemoryError::InvalidConfig(
                "memory budget must be non-zero".into(),
            ));
        }
        thresholds.validate()?;
        Ok(Self::build(budget, thresholds))
    }

    fn build(budget: Size, thresholds: PressureThresholds) -> Self {
        Self {
            id: NEXT_DETECTOR_ID.fetch_add(1, Ordering::Relaxed),
            budget: AtomicUsize::new(budget),
            thresholds,
            level: AtomicU8::new(PressureLevel::Low as u8),
            last_usage: AtomicUsize::new(0),
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            escalations: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
        }
    }

    /// Process-wide detector sized with the default budget
    pub fn global() -> Arc<PressureDetector> {
        static GLOBAL: OnceLock<Arc<PressureDetector>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(Self::build(
                    DEFAULT_MEMORY_BUDGET,
                    PressureThresholds::default(),
                ))
            })
            .clone()
    }

    /// Recompute the level for `current_bytes`.
    ///
    /// Returns the change, if any. On a rise, registered callbacks run
    /// before this returns, unless the caller is itself inside a callback.
    pub fn update(&self, current_bytes: Size) -> Option<PressureChange> {
        self.last_usage.store(current_bytes, Ordering::Relaxed);
        let current = self.thresholds.level_for(self.ratio_of(current_bytes));
        let previous = PressureLevel::from_u8(self.level.swap(current as u8, Ordering::AcqRel));
        if current == previous {
            return None;
        }

        let change = PressureChange { previous, current };
        if change.is_escalation() {
            self.escalations.fetch_add(1, Ordering::Relaxed);
            warn!(
                from = %previous,
                to = %current,
                used = current_bytes,
                budget = self.budget(),
                "Memory pressure rising"
            );
            self.dispatch(current);
        } else {
            debug!(from = %previous, to = %current, "Memory pressure easing");
        }
        Some(change)
    }

    fn dispatch(&self, level: PressureLevel) {
        let Some(_guard) = DispatchGuard::enter(self.id) else {
            return;
        };

        // Snapshot so callbacks may (un)register without deadlocking
        let callbacks: Vec<PressureCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        if callbacks.is_empty() {
            return;
        }

        let freed: Size = callbacks.iter().map(|callback| callback(level)).sum();
        self.bytes_reclaimed
            .fetch_add(freed as u64, Ordering::Relaxed);
        info!(level = %level, callbacks = callbacks.len(), freed, "Pressure callbacks ran");
    }

    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(PressureLevel) -> Size + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub fn budget(&self) -> Size {
        self.budget.load(Ordering::Relaxed)
    }

    /// Change the budget and re-evaluate against the last observed usage
    pub fn set_budget(&self, budget: Size) -> MemoryResult<Option<PressureChange>> {
        if budget == 0 {
            return Err(MemoryError::InvalidConfig(
                "memory budget must be non-zero".into(),
            ));
        }
        self.budget.store(budget, Ordering::Relaxed);
        Ok(self.update(self.last_usage.load(Ordering::Relaxed)))
    }

    pub fn thresholds(&self) -> PressureThresholds {
        self.thresholds
    }

    pub fn usage_ratio(&self) -> f64 {
        self.ratio_of(self.last_usage.load(Ordering::Relaxed))
    }

    fn ratio_of(&self, bytes: Size) -> f64 {
        bytes as f64 / self.budget().max(1) as f64
    }

    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }
}

impl std::fmt::Debug for PressureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureDetector")
            .field("budget", &self.budget())
            .field("level", &self.level())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}
