/*!
 * Memory Core Library
 * Policy-driven memory manager with pluggable allocator strategies
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use crate::core::errors::{ConstructError, MemoryError, MemoryResult};
pub use memory::{
    AllocationStrategy, HealthReport, ManagedBox, ManagerConfig, MemoryManager, MemoryPolicy,
    ObjectFactory, PerformanceMetrics, PressureLevel,
};
pub use monitoring::{init_tracing, TraceFormat};
