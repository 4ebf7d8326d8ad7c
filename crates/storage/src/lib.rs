//! Visit storage abstraction for visitstat.
//!
//! This crate provides the [`VisitStore`] trait and the data model that
//! every other visitstat crate builds on. The statistics engine only ever
//! talks to a `VisitStore`, so backends can be swapped without touching
//! ingestion, counting, aggregation or cleanup.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    visitstat-engine                         │
//! │   Ingestor │ Counter │ Aggregator │ Cleaner │ Readiness     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   visitstat-storage                         │
//! │                   VisitStore trait                          │
//! │  (insert, count, group_by_path_client, delete_group_below)  │
//! ├──────────────────┬──────────────────────────────────────────┤
//! │ MemoryVisitStore │  SqliteVisitStore                        │
//! │ (tests, dev)     │  (visitstat-storage-sqlite)              │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use chrono::Utc;
//! use visitstat_storage::{MemoryVisitStore, Partition, Visit, VisitStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryVisitStore::new();
//!     let partition = Partition::from("blog.example.com");
//!
//!     store
//!         .insert(&Visit {
//!             partition: partition.clone(),
//!             visitor_id: "9b2f3a4e-1111-4222-8333-444455556666".into(),
//!             path: "/posts/hello".to_owned(),
//!             client_address: "203.0.113.7".to_owned(),
//!             user_agent: "curl/8.0".to_owned(),
//!             referrer: String::new(),
//!             occurred_at: Utc::now(),
//!         })
//!         .await?;
//!
//!     let site = store.count(&partition, None).await?;
//!     assert_eq!((site.pv, site.uv), (1, 1));
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Persistence |
//! |---------|----------|-------------|
//! | [`MemoryVisitStore`] | Testing, development | No |
//! | `SqliteVisitStore` (in `visitstat-storage-sqlite`) | Production | Yes |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (visit builders, `FlakyStore`, assertion
//!   macros) and the `conformance` suite. Enable this in `[dev-dependencies]` for integration
//!   tests.
//! - **`failpoints`**: Activates `fail` failpoints in the in-memory backend.

#![deny(unsafe_code)]

pub mod backend;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod error;
pub mod health;
pub mod memory;
pub mod metrics;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::VisitStore;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use health::{HealthMetadata, HealthProbe, HealthStatus};
pub use memory::MemoryVisitStore;
pub use metrics::{Metrics, MetricsSnapshot};
pub use types::{DailyStat, Partition, PathClientCount, PathTotal, StatRow, Visit, VisitCount, VisitorId};
