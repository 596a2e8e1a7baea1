//! Error types for `fieldcrypt` operations.

use std::fmt;

/// Main error type for `fieldcrypt` operations.
///
/// Cryptographic and schema failures are never folded into "not found":
/// an empty result set is `Ok(vec![])`, an invalid query or key is an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Master key missing or corrupt, or a data key could not be unwrapped.
    /// Fatal and never retried.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Another caller created a data key under the same alias first.
    #[error("key alias conflict: {0}")]
    AliasConflict(String),

    /// A plaintext value does not fit the field's declared type or range bounds.
    #[error("invalid plaintext for '{path}': {reason}")]
    InvalidPlaintextDomain {
        /// Field path
        path: String,
        /// What was wrong with the value
        reason: String,
    },

    /// A token does not match the expected structure, or was encrypted
    /// under a different data key.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The predicate cannot be evaluated (e.g. `lo > hi`, or no matching
    /// query capability for the field).
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    /// The schema definition was rejected.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Pass-through from the storage boundary.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

impl Error {
    /// Returns `true` for errors that must abort startup or the current
    /// request without retry.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::KeyUnavailable(_))
    }

    pub(crate) fn domain(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPlaintextDomain { path: path.to_string(), reason: reason.into() }
    }
}

/// Errors specific to master key and key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// No master key could be found or generated
    MasterKeyUnavailable(String),

    /// Master key has the wrong length or encoding
    InvalidMasterKey(String),

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed (wrong master key or corrupted material)
    UnwrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MasterKeyUnavailable(msg) => write!(f, "master key unavailable: {msg}"),
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<KeyProviderError> for Error {
    fn from(err: KeyProviderError) -> Self {
        Self::KeyUnavailable(err.to_string())
    }
}

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// A unique index rejected the write
    #[error("duplicate key on index '{index}'")]
    DuplicateKey {
        /// Name of the violated index
        index: String,
    },

    /// The collection already exists
    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    /// The collection does not exist
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// The engine refused the document or filter
    #[error("rejected by storage engine: {0}")]
    Rejected(String),

    /// Transient or connectivity failure
    #[error("{0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_provider_error_becomes_key_unavailable() {
        let err: Error = KeyProviderError::UnwrapFailed("bad tag".to_string()).into();
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_storage_error_passes_through() {
        let err: Error = StorageError::Unavailable("connection reset".to_string()).into();
        assert!(matches!(err, Error::StorageUnavailable(StorageError::Unavailable(_))));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "storage unavailable: connection reset");
    }

    #[test]
    fn test_domain_error_display() {
        let err = Error::domain("salary", "above declared max 10");
        assert_eq!(err.to_string(), "invalid plaintext for 'salary': above declared max 10");
    }
}
