//! SQLite visit store for visitstat.
//!
//! This crate provides [`SqliteVisitStore`], a durable implementation of the
//! [`VisitStore`](visitstat_storage::VisitStore) trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    visitstat-engine                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │              visitstat-storage (VisitStore)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  SqliteVisitStore                           │
//! │   table per partition: "visits/<hostname>"                  │
//! │   indexes: (path, ip), (ip)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │          rusqlite (bundled SQLite) + spawn_blocking         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use visitstat_storage_sqlite::{SqliteStoreConfig, SqliteVisitStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteVisitStore::open(SqliteStoreConfig::builder().path("visits.db").build()?).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Internal failures are reported as [`SqliteStorageError`] and converted
//! to [`StorageError`](visitstat_storage::StorageError) at the trait
//! boundary. A busy or locked database becomes a transient
//! `StorageError::Connection`.

#![deny(unsafe_code)]

mod backend;
mod config;
mod error;
mod schema;

pub use backend::SqliteVisitStore;
pub use config::SqliteStoreConfig;
pub use error::{Result, SqliteStorageError};
