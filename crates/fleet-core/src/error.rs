//! Error types for the core domain.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A persisted action status tag has no counterpart in `ActionStatus`.
    /// Indicates a code/schema mismatch and is never retried.
    #[error("unrecognized action status tag: {0}")]
    UnrecognizedStatus(u8),

    #[error("unknown status name: {0}")]
    UnknownStatusName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
