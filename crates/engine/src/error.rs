//! Engine error types.
//!
//! Storage failures surface through [`EngineError::Persistence`] (writes)
//! or [`EngineError::Query`] (reads), keeping the original
//! [`StorageError`] as the source. Index readiness failures and skipped
//! partitions are never returned: they are logged and, for aggregation,
//! reported in [`Dashboard::skipped`](crate::Dashboard::skipped).

use thiserror::Error;
use visitstat_storage::{ConfigError, StorageError};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by the statistics engine.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The origin of a declared URL is not in the allow list.
    #[error("Origin not allowed: {origin}")]
    OriginRejected {
        /// The rejected `scheme://host[:port]`.
        origin: String,
    },

    /// The declared URL could not be parsed or has no host.
    #[error("Invalid URL {url:?}: {message}")]
    InvalidUrl {
        /// The URL as supplied by the client.
        url: String,
        /// What is wrong with it.
        message: String,
        /// Parser error, when parsing failed.
        #[source]
        source: Option<url::ParseError>,
    },

    /// Persisting a visit failed or timed out.
    #[error("Persistence error: {source}")]
    Persistence {
        /// The storage failure.
        #[source]
        source: StorageError,
    },

    /// A read query failed or timed out.
    #[error("Query error: {source}")]
    Query {
        /// The storage failure.
        #[source]
        source: StorageError,
    },

    /// The storage backend stayed unreachable during startup.
    #[error("Storage unavailable after {attempts} connectivity probes")]
    Unavailable {
        /// Probes made before giving up.
        attempts: u32,
        /// Error from the last probe, if it returned one.
        #[source]
        source: Option<StorageError>,
    },

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Creates an `OriginRejected` error.
    #[must_use]
    pub fn origin_rejected(origin: impl Into<String>) -> Self {
        Self::OriginRejected { origin: origin.into() }
    }

    /// Creates an `InvalidUrl` error without a parser source.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into(), message: message.into(), source: None }
    }

    /// Creates an `InvalidUrl` error from a parser failure.
    #[must_use]
    pub fn invalid_url_with_source(url: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl { url: url.into(), message: source.to_string(), source: Some(source) }
    }

    /// Wraps a failed write.
    #[must_use]
    pub fn persistence(source: StorageError) -> Self {
        Self::Persistence { source }
    }

    /// Wraps a failed read.
    #[must_use]
    pub fn query(source: StorageError) -> Self {
        Self::Query { source }
    }

    /// Returns the underlying storage error, if any.
    #[must_use]
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Persistence { source } | Self::Query { source } => Some(source),
            Self::Unavailable { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    /// Returns `true` if the failure came from a storage timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.storage_error(), Some(StorageError::Timeout))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_query_keeps_storage_source() {
        let err = EngineError::query(StorageError::connection("refused"));
        assert_eq!(err.to_string(), "Query error: Connection error: refused");
        assert!(err.source().is_some());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(EngineError::persistence(StorageError::timeout()).is_timeout());
        assert!(!EngineError::origin_rejected("https://evil.example").is_timeout());
    }

    #[test]
    fn test_invalid_url_from_parser() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let err = EngineError::invalid_url_with_source("not a url", parse_err);
        assert!(matches!(err, EngineError::InvalidUrl { source: Some(_), .. }));
        assert!(err.to_string().starts_with("Invalid URL \"not a url\""));
    }

    #[test]
    fn test_unavailable_display() {
        let err = EngineError::Unavailable { attempts: 10, source: None };
        assert_eq!(err.to_string(), "Storage unavailable after 10 connectivity probes");
        assert!(err.storage_error().is_none());
    }
}
