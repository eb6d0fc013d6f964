/*!
 * Memory Module
 * Policy-driven allocation, tracking and diagnostics
 */

pub mod allocators;
pub mod manager;
pub mod numa;
pub mod pressure;
pub mod simd;
pub mod tracker;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use manager::{ManagedBox, ManagerConfig, MemoryManager, ObjectFactory};
pub use pressure::{CallbackId, PressureChange, PressureDetector, PressureThresholds};
pub use tracker::{AllocationRecord, MemoryTracker, ProfileFormat};
pub use traits::*;
pub use types::*;
