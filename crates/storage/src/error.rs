//! Storage error types and result alias.
//!
//! Every [`VisitStore`](crate::VisitStore) backend maps its internal errors
//! to [`StorageError`] so the engine can classify failures without knowing
//! which backend produced them.
//!
//! # Error Types
//!
//! - [`StorageError::Connection`] - The backend could not be reached
//! - [`StorageError::Serialization`] - A stored row could not be decoded
//! - [`StorageError::Internal`] - Backend-specific failure
//! - [`StorageError::Timeout`] - Operation exceeded its time limit
//!
//! # Example
//!
//! ```
//! use visitstat_storage::{StorageError, StorageResult};
//!
//! fn open() -> StorageResult<()> {
//!     Err(StorageError::connection("database file is locked"))
//! }
//!
//! assert!(open().unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via `#[source]`, so logging the error
/// with `{:#}`-style reporters shows the backend's original failure.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The backend could not be reached or refused the connection.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// A stored row could not be decoded into the data model.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused decoding to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for backend-specific errors.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its configured time limit.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` when retrying the same operation later may succeed.
    ///
    /// Connection failures and timeouts are transient. Decoding failures and
    /// internal errors are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

/// Invalid configuration value.
///
/// Returned by configuration builders when a field is outside its valid
/// range. Messages name the offending field so operators can fix the config
/// without reading source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Rejected value.
        value: String,
    },

    /// A duration field must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the field.
        field: &'static str,
        /// Rejected value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::connection("refused").is_transient());
        assert!(StorageError::timeout().is_transient());
        assert!(!StorageError::internal("boom").is_transient());
        assert!(!StorageError::serialization("bad row").is_transient());
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::other("disk gone");
        let err = StorageError::internal_with_source("write failed", io);
        assert_eq!(err.to_string(), "Internal error: write failed");
        assert_eq!(err.source().map(ToString::to_string), Some("disk gone".to_owned()));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum { field: "max_attempts", min: "1".into(), value: "0".into() };
        assert_eq!(err.to_string(), "max_attempts must be at least 1, got 0");

        let err = ConfigError::MustBePositive { field: "base_delay", value: "0s".into() };
        assert_eq!(err.to_string(), "base_delay must be positive, got 0s");
    }
}
