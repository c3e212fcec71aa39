//! Unified error types for cistern.
//!
//! All errors are represented by [`CisternError`], using `thiserror` for
//! ergonomic error definitions, with one variant per failure kind so callers
//! match on what went wrong rather than parsing messages. Library code never
//! uses `unwrap()` — all fallible operations return `Result<T, CisternError>`.

use thiserror::Error;

/// The unified error type for all bucket operations.
#[derive(Error, Debug)]
pub enum CisternError {
    /// The caller supplied an unusable argument: a NUL byte in a key, an
    /// invalid regular expression, or an empty required option.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the rejected input.
        message: String,
    },

    /// The requested key does not exist in the bucket.
    #[error("not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// The key already exists and the operation required it not to.
    #[error("already exists: {key}")]
    AlreadyExists {
        /// The conflicting key.
        key: String,
    },

    /// A network or backend-service failure, surfaced after the configured
    /// retries are exhausted.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Content read back from the backend did not match the recorded hash.
    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The key whose content failed verification.
        key: String,
        /// The hash recorded at write time.
        expected: String,
        /// The hash computed from the data read back.
        actual: String,
    },

    /// The operation observed a cancelled token.
    #[error("operation cancelled")]
    Cancelled,

    /// A batched removal partially failed.
    #[error("removal failed for {} key(s): {}", keys.len(), keys.join(", "))]
    Removal {
        /// The keys that could not be removed.
        keys: Vec<String>,
    },

    /// A local filesystem failure.
    #[error("i/o error: {message}")]
    Io {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CisternError {
    /// Create an invalid-input error from a message.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a not-found error for a key.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a transport error from a message and source error.
    pub fn transport(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error from a message only.
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create an I/O error from a message and source error.
    pub fn io(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an I/O error from a message only.
    pub fn io_msg(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Map an I/O error raised while streaming data under `key`.
    ///
    /// Stream adapters (for example checksum-verifying readers) can only
    /// surface failures as `std::io::Error`; this recovers a typed error
    /// smuggled through one, and otherwise maps `NotFound` to the bucket
    /// not-found kind.
    pub fn from_io(key: &str, err: std::io::Error) -> Self {
        let err = match err.downcast::<CisternError>() {
            Ok(typed) => return typed,
            Err(err) => err,
        };
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                key: key.to_string(),
            },
            _ => Self::Io {
                message: format!("reading {key}"),
                source: Some(Box::new(err)),
            },
        }
    }

    /// Whether this error is the not-found kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error is the cancelled kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_recovers_typed_error() {
        let typed = CisternError::ChecksumMismatch {
            key: "k".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, typed);
        let recovered = CisternError::from_io("k", io);
        assert!(matches!(recovered, CisternError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = CisternError::from_io("some/key", io);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_io_maps_other_kinds_to_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = CisternError::from_io("some/key", io);
        assert!(matches!(err, CisternError::Io { .. }));
    }

    #[test]
    fn test_removal_lists_keys() {
        let err = CisternError::Removal {
            keys: vec!["a".into(), "b".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 key(s)"));
        assert!(text.contains("a, b"));
    }
}
