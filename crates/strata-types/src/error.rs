//! The unified error taxonomy of the storage contract.

use thiserror::Error;

use crate::version::ResourceVersion;

/// Errors produced by storage, watch, and pagination operations.
///
/// Every public operation yields either a successful value or exactly one
/// of these variants. All variants are cloneable so terminal watch events
/// and retry loops can carry them by value; underlying I/O and
/// serialization failures are captured as strings inside [`Internal`].
///
/// [`Internal`]: StorageError::Internal
#[derive(Clone, Debug, Error)]
pub enum StorageError {
    /// The key holds no live object (or held none at the requested version).
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A live object already occupies the key.
    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    /// A precondition or version check failed against the current state.
    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    /// Malformed input: bad key, precondition, or continuation token.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The requested history predates the retention horizon.
    #[error("revision {requested} is older than the retention horizon {horizon}")]
    Gone {
        requested: ResourceVersion,
        horizon: ResourceVersion,
    },

    /// Underlying I/O or serialization failure.
    #[error("internal storage error: {0}")]
    Internal(String),

    /// The operation exceeded its bound (watch lifetime, freshness wait).
    #[error("timed out: {0}")]
    Timeout(String),

    /// A paged continuation could not be resumed against its snapshot.
    #[error("inconsistent continuation: {0}")]
    InconsistentContinuation(String),

    /// The caller canceled the operation before it completed.
    #[error("operation canceled")]
    Canceled,
}

impl StorageError {
    /// `NotFound` for the given key.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// `AlreadyExists` for the given key.
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// `Conflict` for the given key and reason.
    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for version/precondition conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io error: {err}"))
    }
}

/// Convenience alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_key() {
        let err = StorageError::not_found("ns1/a");
        assert_eq!(err.to_string(), "key not found: ns1/a");
    }

    #[test]
    fn io_error_maps_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Internal(_)));
    }

    #[test]
    fn conflict_predicate() {
        assert!(StorageError::conflict("k", "rv changed").is_conflict());
        assert!(!StorageError::Canceled.is_conflict());
    }
}
