//! PV/UV counting for a page or a whole site.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use visitstat_storage::{Metrics, Partition, VisitCount, VisitStore};

use crate::{
    error::{EngineError, EngineResult},
    timeout::bounded,
};

/// What a count covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Visits of one path.
    Page(String),
    /// Every visit of the partition.
    Site,
}

impl Scope {
    /// Creates a page scope.
    pub fn page(path: impl Into<String>) -> Self {
        Self::Page(path.into())
    }

    fn path(&self) -> Option<&str> {
        match self {
            Self::Page(path) => Some(path),
            Self::Site => None,
        }
    }
}

/// Read-only PV/UV counter.
///
/// Counts are not retried. A failure or an elapsed time limit is
/// returned as [`EngineError::Query`].
pub struct Counter<S: ?Sized> {
    store: Arc<S>,
    timeout: Duration,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized> Counter<S> {
    /// Creates a counter bounding every call by `timeout`.
    pub fn new(store: Arc<S>, timeout: Duration, metrics: Metrics) -> Self {
        Self { store, timeout, metrics }
    }

    /// Counts page views and unique visitors of `scope` in `partition`.
    ///
    /// A partition without visits counts as zero.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Query`] if the store fails or the time limit
    /// elapses.
    #[tracing::instrument(skip_all, fields(partition = %partition, path = scope.path()))]
    pub async fn count(&self, partition: &Partition, scope: &Scope) -> EngineResult<VisitCount> {
        let start = Instant::now();
        let count = bounded(self.timeout, &self.metrics, self.store.count(partition, scope.path()))
            .await
            .map_err(EngineError::query)?;
        self.metrics.record_count(start.elapsed());
        Ok(count)
    }
}

impl<S: ?Sized> std::fmt::Debug for Counter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use visitstat_storage::{
        MemoryVisitStore, StorageError,
        testutil::{FlakyStore, populated_store},
    };

    use super::*;

    #[tokio::test]
    async fn test_page_and_site_scopes() {
        let store = populated_store(&[
            ("a.com", "/x", "1"),
            ("a.com", "/x", "1"),
            ("a.com", "/x", "2"),
            ("a.com", "/y", "3"),
            ("b.com", "/x", "9"),
        ])
        .await;
        let counter = Counter::new(Arc::new(store), Duration::from_secs(1), Metrics::new());
        let partition = Partition::from("a.com");

        let page = counter.count(&partition, &Scope::page("/x")).await.expect("page count");
        assert_eq!((page.pv, page.uv), (3, 2));

        let site = counter.count(&partition, &Scope::Site).await.expect("site count");
        assert_eq!((site.pv, site.uv), (4, 3));
    }

    #[tokio::test]
    async fn test_missing_partition_counts_zero() {
        let counter = Counter::new(Arc::new(MemoryVisitStore::new()), Duration::from_secs(1), Metrics::new());
        let count = counter.count(&Partition::from("nowhere"), &Scope::Site).await.expect("count");
        assert_eq!(count, VisitCount::default());
    }

    #[tokio::test]
    async fn test_store_failure_is_a_query_error() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_counts();
        let counter = Counter::new(Arc::new(store.clone()), Duration::from_secs(1), Metrics::new());

        let err = counter.count(&Partition::from("a.com"), &Scope::Site).await.expect_err("should fail");
        assert!(matches!(err, EngineError::Query { source: StorageError::Connection { .. } }));
        assert_eq!(store.count_calls(), 1, "counts are not retried");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_count_times_out() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.delay_counts(Duration::from_secs(30));
        let metrics = Metrics::new();
        let counter = Counter::new(Arc::new(store), Duration::from_secs(10), metrics.clone());

        let err = counter.count(&Partition::from("a.com"), &Scope::page("/")).await.expect_err("should time out");
        assert!(err.is_timeout());
        assert_eq!(metrics.snapshot().timeout_count, 1);
        assert_eq!(metrics.snapshot().count_count, 0);
    }
}
