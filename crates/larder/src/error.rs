//! Error types for the cache crate

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Boxed error returned by producer callbacks (compute and codec).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error from the object store or its backing volume
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(larder::io),
        help("Check file permissions and ensure the cache volume is mounted")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "delete")
        operation: String,
    },

    /// Metadata store failure (query, schema, or connection trouble)
    #[error("Metadata store error: {message}")]
    #[diagnostic(code(larder::metadata))]
    Metadata {
        /// Description of the underlying database failure
        message: String,
    },

    /// Item key never seen, or resident blob missing after repair
    #[error("Cache item not found: {key}")]
    #[diagnostic(
        code(larder::not_found),
        help("The item may have been evicted, forgotten, or never computed")
    )]
    NotFound {
        /// Hex rendering of the item key that was not found
        key: String,
    },

    /// A stored blob could not be reconstructed into an object
    #[error("Corrupt blob for item {key}: {reason}")]
    #[diagnostic(
        code(larder::corrupt_blob),
        help("The blob is demoted and recomputed once; a second failure surfaces as a producer error")
    )]
    CorruptBlob {
        /// Hex rendering of the affected item key
        key: String,
        /// Why deserialization refused the bytes
        reason: String,
    },

    /// A producer callback failed; nothing was recorded
    #[error("Producer {stage} failed")]
    #[diagnostic(code(larder::producer))]
    Producer {
        /// Which callback failed ("compute" or "serialize")
        stage: &'static str,
        /// The producer's own error
        #[source]
        source: BoxError,
    },

    /// Metadata and object store disagree in a way prune could not repair
    #[error("Invariant violation: {message}")]
    #[diagnostic(code(larder::invariant))]
    InvariantViolation {
        /// Description of the disagreement
        message: String,
    },

    /// Configuration value out of range
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(larder::config))]
    Config {
        /// Which option is invalid and why
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a metadata store error
    #[must_use]
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata {
            message: msg.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a corrupt blob error
    #[must_use]
    pub fn corrupt_blob(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptBlob {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a producer error for the given stage
    #[must_use]
    pub fn producer(stage: &'static str, source: BoxError) -> Self {
        Self::Producer { stage, source }
    }

    /// Create an invariant violation error
    #[must_use]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::metadata(e.to_string())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
