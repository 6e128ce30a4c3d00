//! Error types for the oerflow pipeline.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI binary wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Topology definition or wiring error (unresolvable bindings, bad graph).
    #[error("topology error: {message}")]
    Topology { message: String },

    /// Upstream source error (queue unreachable, malformed message).
    #[error("source error: {0}")]
    Source(String),

    /// Content-extraction collaborator error.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Concept-enrichment collaborator error.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Record failed the validation policy.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// External call exceeded its bounded timeout.
    #[error("timeout after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a topology error from any displayable message.
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
