//! Unified error types for the Strata workspace.
//!
//! Graph drivers and metadata stores report failures with the same enum;
//! the layer store wraps them in [`StrataError::Backend`] before handing
//! them to callers so that backend detail stays opaque.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StrataError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A read-write layer with the same name is still live.
    #[error("mount already exists with name: {name}")]
    NameConflict {
        /// Conflicting mount name.
        name: String,
    },

    /// A handle was released that the store never handed out.
    #[error("layer not retained: {id}")]
    NotRetained {
        /// Identifier of the layer or mount.
        id: String,
    },

    /// The layer chain would be deeper than the backend can stack.
    #[error("max depth exceeded: layer chains are limited to {max} layers")]
    MaxDepthExceeded {
        /// Configured maximum chain length.
        max: usize,
    },

    /// An image config lists more non-empty history entries than layers.
    #[error("too many non-empty layers in history section: {history} history entries for {diff_ids} layers")]
    TooManyLayers {
        /// Number of non-empty history entries.
        history: usize,
        /// Number of `RootFS` diff ids.
        diff_ids: usize,
    },

    /// A graph driver or metadata store operation failed.
    #[error("{operation} failed: {source}")]
    Backend {
        /// Operation that was being performed.
        operation: &'static str,
        /// Underlying backend error.
        source: Box<StrataError>,
    },

    /// A digest string could not be parsed.
    #[error("invalid digest: {value}")]
    InvalidDigest {
        /// The rejected input.
        value: String,
    },

    /// A short identifier matched more than one entry.
    #[error("ambiguous identifier: {term}")]
    Ambiguous {
        /// The search term.
        term: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StrataError {
    /// Wraps a driver or metadata error as an opaque backend failure.
    #[must_use]
    pub fn backend(operation: &'static str, source: Self) -> Self {
        Self::Backend {
            operation,
            source: Box::new(source),
        }
    }

    /// Builds an [`StrataError::Io`] for the given path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if this error (or the backend error it wraps) is a
    /// `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::Backend { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_wrapper_keeps_not_found() {
        let inner = StrataError::NotFound {
            kind: "layer",
            id: "sha256:abc".into(),
        };
        let err = StrataError::backend("metadata read", inner);
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("metadata read failed"));
    }

    #[test]
    fn io_not_found_is_not_found() {
        let err = StrataError::io(
            "/nonexistent",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn conflict_is_not_not_found() {
        let err = StrataError::NameConflict { name: "c1".into() };
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "mount already exists with name: c1");
    }
}
