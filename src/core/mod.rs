/*!
 * Core Module
 * Shared types, limits and error handling for the memory subsystem
 */

pub mod errors;
pub mod limits;
pub mod types;

// Re-export for convenience
pub use errors::*;
pub use types::*;
