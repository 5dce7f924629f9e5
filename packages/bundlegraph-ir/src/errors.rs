//! Error types for bundlegraph-ir
//!
//! Provides unified error handling across the crate.

use thiserror::Error;

/// Main error type for bundle combination and dependency resolution.
///
/// `Bug` covers internal-consistency violations (dangling region
/// dependencies, missing name assignments, and the like). These indicate a
/// broken invariant rather than bad user input and are never recovered from.
#[derive(Debug, Error)]
pub enum IrError {
    /// Internal consistency violation
    #[error("bug: {0}")]
    Bug(String),

    /// Package version resolution failure
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A path the combiner does not support yet
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl IrError {
    /// Create an internal-consistency error
    pub fn bug(msg: impl Into<String>) -> Self {
        IrError::Bug(msg.into())
    }

    /// Create a resolution-policy error
    pub fn resolution(msg: impl Into<String>) -> Self {
        IrError::Resolution(msg.into())
    }
}

/// Result type alias for bundle combination operations
pub type Result<T> = std::result::Result<T, IrError>;
