//! Error types for bundlegraph-builder
//!
//! I/O and filesystem errors surface from the collaborators uncaught; `Bug`
//! marks internal-consistency violations of the build graph (a node claiming
//! `unchanged` on its first run, incomplete node states at build end). The
//! runner performs no retries anywhere.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Internal consistency violation in the build graph
    #[error("bug: {0}")]
    Bug(String),

    /// Error from the module-combination engine
    #[error(transparent)]
    Ir(#[from] bundlegraph_ir::IrError),

    /// Filesystem collaborator failure (not found, wrong type)
    #[error("file system error: {0}")]
    Fs(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON input (lock files)
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl BuildError {
    /// Create an internal-consistency error
    pub fn bug(msg: impl Into<String>) -> Self {
        BuildError::Bug(msg.into())
    }

    /// Create a filesystem error
    pub fn fs(msg: impl Into<String>) -> Self {
        BuildError::Fs(msg.into())
    }
}

/// Result type alias for build operations
pub type Result<T> = std::result::Result<T, BuildError>;
