//! Deletion of low-signal `(partition, path)` groups.
//!
//! A scan snapshots the per-path totals, then every group below the
//! threshold is deleted through
//! [`VisitStore::delete_group_below`], which re-checks the count
//! atomically. A group that grew past the threshold after the scan is
//! therefore kept.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use visitstat_storage::{Metrics, PathTotal, StorageResult, VisitStore};

use crate::{
    config::CleanupConfig,
    error::{EngineError, EngineResult},
    timeout::bounded_until,
};

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Visits deleted.
    pub deleted: u64,
    /// Groups that lost their visits.
    pub groups_deleted: u64,
    /// Groups seen by the scan.
    pub groups_scanned: u64,
    /// Groups with fewer visits than this were candidates.
    pub threshold: u64,
}

impl CleanupReport {
    /// Plain-text summary returned to the operator.
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "Cleanup complete. Deleted {} low-visit entries (paths with <{} visits).\n",
            self.deleted, self.threshold
        )
    }
}

/// Runs cleanup passes against a store.
pub struct Cleaner<S: ?Sized> {
    store: Arc<S>,
    config: CleanupConfig,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized> Cleaner<S> {
    /// Creates a cleaner.
    pub fn new(store: Arc<S>, config: CleanupConfig, metrics: Metrics) -> Self {
        Self { store, config, metrics }
    }

    /// Deletes every group below the threshold and returns the number of
    /// deleted visits.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn cleanup(&self) -> EngineResult<u64> {
        self.run().await.map(|report| report.deleted)
    }

    /// Runs one pass and reports what it did.
    ///
    /// Running it again right away deletes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Query`] if the scan fails and
    /// [`EngineError::Persistence`] if a deletion fails. Either also covers
    /// the pass exceeding its time limit. Visits deleted before a failure
    /// stay deleted.
    #[tracing::instrument(name = "cleanup", skip_all, fields(threshold = self.config.threshold))]
    pub async fn run(&self) -> EngineResult<CleanupReport> {
        let deadline = Instant::now() + self.config.timeout;
        let threshold = self.config.threshold;

        let totals =
            bounded_until(deadline, &self.metrics, self.store.path_totals()).await.map_err(EngineError::query)?;

        let mut report = CleanupReport { groups_scanned: totals.len() as u64, threshold, ..CleanupReport::default() };
        for total in totals.iter().filter(|t| t.visits < threshold) {
            let deleted = bounded_until(deadline, &self.metrics, self.delete(total)).await.map_err(|err| {
                self.metrics.record_cleanup(report.deleted);
                EngineError::persistence(err)
            })?;
            if deleted > 0 {
                report.deleted += deleted;
                report.groups_deleted += 1;
                tracing::debug!(partition = %total.partition, path = %total.path, deleted, "group deleted");
            } else {
                tracing::debug!(partition = %total.partition, path = %total.path, "group grew past threshold, kept");
            }
        }

        self.metrics.record_cleanup(report.deleted);
        tracing::info!(
            deleted = report.deleted,
            groups_deleted = report.groups_deleted,
            groups_scanned = report.groups_scanned,
            "cleanup complete"
        );
        Ok(report)
    }

    async fn delete(&self, total: &PathTotal) -> StorageResult<u64> {
        fail::fail_point!("cleanup-delete", |_| {
            Err(visitstat_storage::StorageError::connection("cleanup delete failpoint"))
        });
        self.store.delete_group_below(&total.partition, &total.path, self.config.threshold).await
    }
}

impl<S: ?Sized> std::fmt::Debug for Cleaner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner").field("config", &self.config).finish_non_exhaustive()
    }
}
