//! Engine error types
//!
//! Caller-visible failures of the acceleration engine. Cache and scheduling
//! outcomes (`CapacityExceeded`, `Cancelled`) exist in the taxonomy so they can
//! be logged and sampled, but the engine absorbs them before they reach a
//! caller.

use thiserror::Error;

/// Unified engine error type
///
/// `Clone` so that a single failed execution can be delivered to every waiter
/// attached to the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccelError {
    /// Page index out of range for the document
    #[error("Page {page} not found (document has {page_count} pages)")]
    NotFound { page: usize, page_count: usize },

    /// Artifact larger than the whole budget for its kind
    #[error("Artifact of {size} bytes exceeds cache budget of {budget} bytes")]
    CapacityExceeded { size: usize, budget: usize },

    /// Both execution paths failed (or the only available one did)
    #[error("Native path failure: {0}")]
    NativePathFailure(String),

    /// A progressive or batch operation was superseded
    #[error("Operation cancelled")]
    Cancelled,

    /// Fast path capability probe failed
    #[error("Fast path unavailable: {0}")]
    Unavailable(String),

    /// Document id not registered (never opened or already closed)
    #[error("Document not open: {0}")]
    DocumentNotOpen(String),

    /// Document is password protected and no valid password was supplied
    #[error("Document is locked: {0}")]
    Locked(String),

    /// Execution path exceeded its deadline
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Malformed request (empty range, zero batch size, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AccelError {
    /// Whether the error should be surfaced to callers of the public contract
    pub fn is_caller_visible(&self) -> bool {
        !matches!(self, AccelError::CapacityExceeded { .. } | AccelError::Cancelled)
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AccelError>;
