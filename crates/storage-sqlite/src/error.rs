//! Error types for the SQLite visit store.
//!
//! This module maps `rusqlite` failures onto the generic
//! [`StorageError`](visitstat_storage::StorageError) so the engine can
//! classify them without knowing about SQLite.

use rusqlite::ErrorCode;
use thiserror::Error;
use visitstat_storage::{ConfigError, StorageError};

/// Result type alias for SQLite storage operations.
pub type Result<T> = std::result::Result<T, SqliteStorageError>;

/// Errors specific to the SQLite visit store.
#[derive(Debug, Error)]
pub enum SqliteStorageError {
    /// Error from SQLite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stored value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The blocking task running a statement panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The caller stopped waiting before the statement got the connection.
    #[error("Operation abandoned before it started")]
    Abandoned,
}

impl From<SqliteStorageError> for StorageError {
    fn from(err: SqliteStorageError) -> Self {
        match err {
            SqliteStorageError::Sqlite(source) => sqlite_error_to_storage_error(source),
            SqliteStorageError::Config(source) => StorageError::internal_with_source("Config", source),
            SqliteStorageError::Decode(message) => StorageError::serialization(message),
            SqliteStorageError::Join(source) => {
                StorageError::internal_with_source("SQLite worker task failed", source)
            },
            SqliteStorageError::Abandoned => StorageError::timeout(),
        }
    }
}

/// Busy and locked databases clear up on their own, so they map to the
/// transient `Connection` variant. So does a file that cannot be opened.
fn sqlite_error_to_storage_error(err: rusqlite::Error) -> StorageError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            tracing::debug!(error = %err, "SQLite database busy");
            StorageError::connection_with_source("database is busy", err)
        },
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase) => {
            StorageError::connection_with_source("cannot open database", err)
        },
        // Only abandoned calls are interrupted, and their callers already
        // gave up on the time limit.
        Some(ErrorCode::OperationInterrupted) => StorageError::timeout(),
        _ => match err {
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                StorageError::serialization_with_source("unexpected column value", err)
            },
            other => StorageError::internal_with_source("SQLite statement failed", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_maps_to_transient_connection() {
        let err: StorageError = SqliteStorageError::from(sqlite_failure(ffi::SQLITE_BUSY)).into();
        assert!(matches!(err, StorageError::Connection { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_locked_maps_to_transient_connection() {
        let err: StorageError = SqliteStorageError::from(sqlite_failure(ffi::SQLITE_LOCKED)).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_constraint_maps_to_internal() {
        let err: StorageError = SqliteStorageError::from(sqlite_failure(ffi::SQLITE_CONSTRAINT)).into();
        assert!(matches!(err, StorageError::Internal { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_interrupted_and_abandoned_map_to_timeout() {
        let err: StorageError = SqliteStorageError::from(sqlite_failure(ffi::SQLITE_INTERRUPT)).into();
        assert!(matches!(err, StorageError::Timeout));
        let err: StorageError = SqliteStorageError::Abandoned.into();
        assert!(matches!(err, StorageError::Timeout));
    }

    #[test]
    fn test_decode_maps_to_serialization() {
        let err: StorageError = SqliteStorageError::Decode("negative count".into()).into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn test_config_maps_to_internal() {
        let config = ConfigError::MustBePositive { field: "busy_timeout", value: "0ns".into() };
        let err: StorageError = SqliteStorageError::from(config).into();
        assert!(matches!(err, StorageError::Internal { .. }));
    }
}
