//! Visit statistics engine for visitstat.
//!
//! The engine records page views for many sites and answers three kinds
//! of questions about them: how many views and unique visitors a page or
//! site has, which paths rank highest over a time window, and which
//! low-signal paths can be deleted. Each site is a [`Partition`] named
//! after its hostname; partitions appear with their first visit.
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Ingestor`] | Validates the declared URL against an [`OriginPolicy`] and persists the visit |
//! | [`Counter`] | PV/UV for a page or a whole site |
//! | [`Aggregator`] | Ranked dashboards across partitions, bounded fan-out |
//! | [`Cleaner`] | Deletes `(partition, path)` groups below a visit threshold |
//! | [`ReadinessManager`] | Creates per-partition indexes once, in the background |
//! | [`VisitStats`] | All of the above wired to one store |
//!
//! Every storage call is bounded by a time limit from [`EngineConfig`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use visitstat_engine::{AllowList, EngineConfig, Partition, VisitRequest, VisitStats, Window};
//! use visitstat_storage::MemoryVisitStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stats = VisitStats::start(
//!         Arc::new(MemoryVisitStore::new()),
//!         Arc::new(AllowList::new(true, ["https://blog.example.com"])),
//!         EngineConfig::default(),
//!     )
//!     .await?;
//!
//!     for client in ["198.51.100.1", "198.51.100.2"] {
//!         let request = VisitRequest::builder()
//!             .declared_url("https://blog.example.com/posts/hello")
//!             .client_address(client)
//!             .build();
//!         stats.record(&request).await?;
//!     }
//!
//!     let dashboard = stats.summarize(Window::days(30)).await?;
//!     let rows = &dashboard.partitions[&Partition::from("blog.example.com")];
//!     assert_eq!((rows[0].pv, rows[0].uv), (2, 2));
//!
//!     stats.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`failpoints`**: Activates `fail` failpoints in the engine and the in-memory backend.

#![deny(unsafe_code)]

pub mod aggregate;
pub mod cleanup;
pub mod config;
pub mod connectivity;
pub mod counter;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod origin;
pub mod readiness;
pub mod report;
mod timeout;

pub use aggregate::{
    Aggregator, Dashboard, DetailSummary, PartitionDetail, SkippedPartition, Window, fold_by_path, rank,
};
pub use cleanup::{Cleaner, CleanupReport};
pub use config::{
    AggregationConfig, CleanupConfig, ConnectivityConfig, EngineConfig, FailurePolicy, ReadinessConfig,
};
pub use connectivity::wait_for_connectivity;
pub use counter::{Counter, Scope};
pub use engine::VisitStats;
pub use error::{EngineError, EngineResult};
pub use identity::{ResolvedIdentity, resolve};
pub use ingest::{IngestOutcome, Ingestor, VisitRequest};
pub use origin::{AllowList, DEVELOPMENT_ORIGINS, OriginPolicy};
pub use readiness::{ReadinessManager, ReadinessState, ReadinessTransition};
pub use report::{DEFAULT_DAYS, MAX_DAYS, ReportSelection, StatReport, parse_days};
pub use visitstat_storage::{Partition, StatRow, VisitCount};
