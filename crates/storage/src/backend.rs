//! Visit store trait definition.
//!
//! [`VisitStore`] is the seam between the statistics engine and whatever
//! holds the visit records. The trait is shaped around the queries the
//! engine issues rather than around a generic key-value interface, so that
//! each backend can push grouping and counting down to its own indexes.
//!
//! # Partitions
//!
//! Every record belongs to exactly one [`Partition`]. A partition comes into
//! existence with its first [`insert`](VisitStore::insert); reading a
//! partition that was never written returns empty results, not an error.
//!
//! # Implementing a Backend
//!
//! 1. Implement [`VisitStore`]
//! 2. Map backend-specific errors to [`StorageError`](crate::StorageError)
//! 3. Run the [`conformance`](crate::conformance) suite against it
//!
//! See [`MemoryVisitStore`](crate::MemoryVisitStore) for a reference
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::StorageResult,
    health::{HealthProbe, HealthStatus},
    types::{DailyStat, Partition, PathClientCount, PathTotal, Visit, VisitCount},
};

/// Storage backend for visit records.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and to support
/// concurrent calls from many requests at once.
///
/// # Operations
///
/// | Method | Used by |
/// |--------|---------|
/// | [`insert`](VisitStore::insert) | Ingestion |
/// | [`list_partitions`](VisitStore::list_partitions) | Aggregator, readiness startup pass |
/// | [`count`](VisitStore::count) | Counter |
/// | [`group_by_path_client`](VisitStore::group_by_path_client) | Aggregator |
/// | [`daily_counts`](VisitStore::daily_counts) | Partition dashboard time series |
/// | [`path_totals`](VisitStore::path_totals) | Cleanup scan |
/// | [`delete_group_below`](VisitStore::delete_group_below) | Cleanup |
/// | [`ensure_indexes`](VisitStore::ensure_indexes) | Readiness manager |
/// | [`health_check`](VisitStore::health_check) | Connectivity wait |
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use visitstat_storage::{MemoryVisitStore, Partition, Visit, VisitStore};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryVisitStore::new();
/// let partition = Partition::from("example.com");
///
/// store
///     .insert(&Visit {
///         partition: partition.clone(),
///         visitor_id: "0d7e3c1a-0000-4000-8000-000000000001".into(),
///         path: "/".to_owned(),
///         client_address: "10.0.0.1".to_owned(),
///         user_agent: String::new(),
///         referrer: String::new(),
///         occurred_at: Utc::now(),
///     })
///     .await
///     .unwrap();
///
/// let count = store.count(&partition, Some("/")).await.unwrap();
/// assert_eq!((count.pv, count.uv), (1, 1));
/// # });
/// ```
#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Persists one visit, creating its partition if needed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn insert(&self, visit: &Visit) -> StorageResult<()>;

    /// Lists every known partition in ascending order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn list_partitions(&self) -> StorageResult<Vec<Partition>>;

    /// Counts visits in `partition`, restricted to `path` when given.
    ///
    /// `pv` is the number of matching visits, `uv` the number of distinct
    /// client addresses among them.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn count(&self, partition: &Partition, path: Option<&str>) -> StorageResult<VisitCount>;

    /// Groups the visits of `partition` by `(path, client_address)`.
    ///
    /// When `since` is set only visits with `occurred_at >= since` are
    /// considered. Results are ordered by `(path, client_address)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn group_by_path_client(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<PathClientCount>>;

    /// Returns PV/UV per UTC day for `partition`, ascending by date.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn daily_counts(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DailyStat>>;

    /// Returns the visit total of every `(partition, path)` group.
    ///
    /// The result is a snapshot taken at call time.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn path_totals(&self) -> StorageResult<Vec<PathTotal>>;

    /// Deletes every visit of the `(partition, path)` group if, at the time
    /// of deletion, the group holds fewer than `threshold` visits.
    ///
    /// The check and the delete happen atomically, so a group that reached
    /// the threshold after a [`path_totals`](VisitStore::path_totals) scan is
    /// left untouched. Returns the number of deleted visits.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete_group_below(
        &self,
        partition: &Partition,
        path: &str,
        threshold: u64,
    ) -> StorageResult<u64>;

    /// Creates the secondary structures that make counting efficient:
    /// one over `(path, client_address)` and one over `client_address`.
    ///
    /// Idempotent; calling it on an already indexed partition is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn ensure_indexes(&self, partition: &Partition) -> StorageResult<()>;

    /// Checks backend health for the given probe.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus>;
}
