/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use crate::core::types::Address;
use miette::Diagnostic;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
///
/// Allocation exhaustion is not represented here: allocators signal it with
/// `None` so hot paths never build an error value.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum MemoryError {
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    #[diagnostic(
        code(memory::out_of_memory),
        help("Reduce the requested capacity or raise the configured limits.")
    )]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(memory::invalid_config),
        help("Capacities must be non-zero and thresholds strictly increasing within (0, 1].")
    )]
    InvalidConfig(String),

    #[error("Invalid alignment {0}: must be a non-zero power of two")]
    #[diagnostic(code(memory::invalid_alignment))]
    InvalidAlignment(usize),

    #[error("Double free detected at 0x{0:x}")]
    #[diagnostic(
        code(memory::double_free),
        help("The block was already released. Check ownership of the pointer.")
    )]
    DoubleFree(Address),

    #[error("Invalid free at 0x{0:x}: address was never allocated here")]
    #[diagnostic(code(memory::invalid_free))]
    InvalidFree(Address),

    #[error("Pointer 0x{address:x} is not owned by {owner}")]
    #[diagnostic(
        code(memory::foreign_pointer),
        help("Return blocks to the allocator or pool that produced them.")
    )]
    ForeignPointer { address: Address, owner: &'static str },

    #[error("Cannot infer size of 0x{0:x}: allocation is not tracked")]
    #[diagnostic(
        code(memory::size_unknown),
        help("Pass the size explicitly or allocate with tracking enabled.")
    )]
    SizeUnknown(Address),

    #[error("Pool '{0}' is not registered")]
    #[diagnostic(code(memory::unknown_pool))]
    UnknownPool(String),

    #[error("Pool '{0}' is already registered")]
    #[diagnostic(
        code(memory::pool_exists),
        help("Unregister the existing pool first; replacing it would orphan its live blocks.")
    )]
    PoolAlreadyRegistered(String),

    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(code(memory::io))]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl MemoryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the error describes a misuse of a block (corruption class)
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree(_) | Self::InvalidFree(_) | Self::ForeignPointer { .. }
        )
    }
}

/// Failure of a fallible constructor passed to the typed allocation helpers
#[derive(Error, Debug)]
pub enum ConstructError<E> {
    /// No allocator could provide the raw block
    #[error("allocation failed: no allocator could satisfy the request")]
    AllocationFailed,

    /// The constructor failed; the raw block has already been released
    #[error("constructor failed")]
    Constructor(#[source] E),
}

impl<E> ConstructError<E> {
    pub fn into_constructor_error(self) -> Option<E> {
        match self {
            Self::Constructor(e) => Some(e),
            Self::AllocationFailed => None,
        }
    }
}
