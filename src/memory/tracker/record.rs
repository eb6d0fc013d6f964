/*!
 * Allocation Records
 */

use crate::core::types::{Address, Size, Tag};
use crate::memory::types::{AllocationStrategy, AllocatorKind, MemoryPolicy};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Metadata of one tracked allocation
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRecord {
    pub address: Address,
    /// Size the caller asked for
    pub size: Size,
    pub alignment: usize,
    pub tag: Tag,
    pub strategy: AllocationStrategy,
    pub source: AllocatorKind,
    /// Custom pool the block came from
    pub pool: Option<Tag>,
    #[serde(skip)]
    pub thread: ThreadId,
    pub thread_name: Option<String>,
    /// Captured when the policy enables stack traces
    pub backtrace: Option<Arc<str>>,
    /// Included in leak detection passes
    pub leak_checked: bool,
    /// Wiped before the block is released
    pub sensitive: bool,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub freed_at: Option<Instant>,
}

impl AllocationRecord {
    pub fn new(
        address: Address,
        size: Size,
        alignment: usize,
        policy: &MemoryPolicy,
        source: AllocatorKind,
    ) -> Self {
        let current = thread::current();
        let backtrace = policy
            .enable_stack_traces
            .then(|| Arc::from(Backtrace::force_capture().to_string()));

        Self {
            address,
            size,
            alignment,
            tag: policy.allocation_tag.clone(),
            strategy: policy.strategy,
            source,
            pool: None,
            thread: current.id(),
            thread_name: current.name().map(str::to_owned),
            backtrace,
            leak_checked: policy.enable_leak_detection,
            sensitive: policy.enable_memory_encryption,
            created_at: Instant::now(),
            freed_at: None,
        }
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(Tag::from(pool));
        self
    }

    /// Time since allocation (or until free, for retired records)
    pub fn age(&self) -> Duration {
        match self.freed_at {
            Some(freed) => freed.duration_since(self.created_at),
            None => self.created_at.elapsed(),
        }
    }

    pub fn is_freed(&self) -> bool {
        self.freed_at.is_some()
    }
}
