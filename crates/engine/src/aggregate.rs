//! Dashboard aggregation across partitions.
//!
//! The store groups visits by `(path, client)`; this module folds those
//! groups into one [`StatRow`] per path and ranks the rows. A full
//! dashboard queries partitions concurrently: a task is spawned only once
//! it holds one of `concurrency` permits, and one deadline is shared by the
//! whole call.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{AcquireError, OwnedSemaphorePermit, Semaphore},
    task::{Id, JoinError, JoinSet},
    time::{Instant, error::Elapsed, timeout_at},
};
use visitstat_storage::{
    DailyStat, Metrics, Partition, PathClientCount, StatRow, StorageError, StorageResult, VisitStore,
};

use crate::{
    config::{AggregationConfig, FailurePolicy},
    error::{EngineError, EngineResult},
    readiness::ReadinessManager,
    timeout::bounded_until,
};

/// Time range of a dashboard query, in whole days back from now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Window {
    days: u32,
}

impl Window {
    /// Visits from the last `days` days. Zero means all time.
    #[must_use]
    pub const fn days(days: u32) -> Self {
        Self { days }
    }

    /// All recorded visits.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { days: 0 }
    }

    /// Length in days, zero when unbounded.
    #[must_use]
    pub const fn span_days(&self) -> u32 {
        self.days
    }

    /// Earliest included instant relative to `now`.
    ///
    /// A window reaching past the earliest representable instant covers
    /// all time, like an unbounded one.
    #[must_use]
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.days == 0 {
            return None;
        }
        TimeDelta::try_days(i64::from(self.days)).and_then(|span| now.checked_sub_signed(span))
    }
}

/// Folds `(path, client)` groups into ranked per-path rows.
///
/// `pv` is the sum of the group sizes and `uv` the number of groups.
#[must_use]
pub fn fold_by_path(groups: &[PathClientCount]) -> Vec<StatRow> {
    let mut by_path: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for group in groups {
        let entry = by_path.entry(group.path.as_str()).or_default();
        entry.0 += group.visits;
        entry.1 += 1;
    }
    let mut rows: Vec<StatRow> =
        by_path.into_iter().map(|(path, (pv, uv))| StatRow { path: path.to_owned(), pv, uv }).collect();
    rank(&mut rows);
    rows
}

/// Sorts by pv descending, then uv descending, then path ascending.
pub fn rank(rows: &mut [StatRow]) {
    rows.sort_by(|a, b| b.pv.cmp(&a.pv).then_with(|| b.uv.cmp(&a.uv)).then_with(|| a.path.cmp(&b.path)));
}

/// A partition left out of a dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPartition {
    /// The partition.
    pub partition: Partition,
    /// Why its query did not complete.
    pub reason: String,
}

/// Ranked rows for every partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    /// Ranked rows keyed by partition, in partition order.
    pub partitions: BTreeMap<Partition, Vec<StatRow>>,
    /// Partitions whose query failed or missed the deadline.
    pub skipped: Vec<SkippedPartition>,
}

impl Dashboard {
    /// Returns `true` if every partition was aggregated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Partition totals of a [`PartitionDetail`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetailSummary {
    /// Sum of the per-path page views.
    pub total_pv: u64,
    /// Sum of the per-path unique visitors.
    pub total_uv: u64,
}

/// Dashboard of a single partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionDetail {
    /// The partition shown, `None` when no partition exists.
    pub hostname: Option<Partition>,
    /// Window length in days, zero for all time.
    pub days: u32,
    /// Every partition, for navigation.
    pub hostnames: Vec<Partition>,
    /// Totals over `paths`.
    pub summary: DetailSummary,
    /// Per-day counts, oldest first.
    pub timeseries: Vec<DailyStat>,
    /// Ranked per-path rows.
    pub paths: Vec<StatRow>,
}

/// Next event of the dispatch loop in [`Aggregator::summarize`].
enum Dispatch {
    Joined(Result<(Id, StorageResult<()>), JoinError>),
    Acquired(Result<Result<OwnedSemaphorePermit, AcquireError>, Elapsed>),
}

/// Builds dashboards from the store.
pub struct Aggregator<S: ?Sized> {
    store: Arc<S>,
    readiness: Arc<ReadinessManager<S>>,
    config: AggregationConfig,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized + 'static> Aggregator<S> {
    /// Creates an aggregator. Queried partitions are handed to `readiness`.
    pub fn new(
        store: Arc<S>,
        readiness: Arc<ReadinessManager<S>>,
        config: AggregationConfig,
        metrics: Metrics,
    ) -> Self {
        Self { store, readiness, config, metrics }
    }

    /// Aggregates every partition over `window`.
    ///
    /// Partitions are dispatched in order, each waiting for a permit before
    /// its task is spawned, so at most `concurrency` tasks exist at once. A
    /// partition whose query fails, or that misses the deadline while
    /// running or while waiting for a permit, is handled by the configured
    /// [`FailurePolicy`]. Dropping the returned future aborts the in-flight
    /// partition queries.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Query`] if partitions cannot be listed, or
    /// for the first failed partition under [`FailurePolicy::Abort`].
    #[tracing::instrument(skip_all, fields(days = window.span_days(), concurrency = self.config.concurrency))]
    pub async fn summarize(&self, window: Window) -> EngineResult<Dashboard> {
        let deadline = Instant::now() + self.config.deadline;
        let partitions =
            bounded_until(deadline, &self.metrics, self.store.list_partitions()).await.map_err(EngineError::query)?;
        for partition in &partitions {
            self.readiness.ensure_once(partition);
        }
        let since = window.since(Utc::now());

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let merged: Arc<Mutex<BTreeMap<Partition, Vec<StatRow>>>> = Arc::default();
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();
        let mut skipped = Vec::new();

        let mut pending = partitions.into_iter();
        let mut next = pending.next();
        while let Some(partition) = next.take() {
            let step = tokio::select! {
                biased;
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => Dispatch::Joined(joined),
                acquired = timeout_at(deadline, Arc::clone(&semaphore).acquire_owned()) => Dispatch::Acquired(acquired),
            };

            let permit = match step {
                Dispatch::Joined(joined) => {
                    next = Some(partition);
                    if let Err(err) = self.settle(joined, &mut owners, &mut skipped) {
                        tasks.abort_all();
                        return Err(err);
                    }
                    continue;
                },
                Dispatch::Acquired(Ok(Ok(permit))) => permit,
                Dispatch::Acquired(Ok(Err(closed))) => {
                    let err = StorageError::internal_with_source("aggregation semaphore closed", closed);
                    if let Err(err) = self.fail(partition, err, &mut skipped) {
                        tasks.abort_all();
                        return Err(err);
                    }
                    next = pending.next();
                    continue;
                },
                Dispatch::Acquired(Err(_elapsed)) => {
                    // Nothing left can start before the deadline.
                    for partition in std::iter::once(partition).chain(pending.by_ref()) {
                        self.metrics.record_timeout();
                        if let Err(err) = self.fail(partition, StorageError::timeout(), &mut skipped) {
                            tasks.abort_all();
                            return Err(err);
                        }
                    }
                    break;
                },
            };

            let store = Arc::clone(&self.store);
            let merged = Arc::clone(&merged);
            let metrics = self.metrics.clone();
            let key = partition.clone();

            let handle = tasks.spawn(async move {
                let _permit = permit;
                let groups = bounded_until(deadline, &metrics, store.group_by_path_client(&key, since)).await?;
                let rows = fold_by_path(&groups);
                merged.lock().insert(key, rows);
                Ok::<(), StorageError>(())
            });
            owners.insert(handle.id(), partition);
            next = pending.next();
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            if let Err(err) = self.settle(joined, &mut owners, &mut skipped) {
                tasks.abort_all();
                return Err(err);
            }
        }

        skipped.sort_by(|a, b| a.partition.cmp(&b.partition));
        let partitions = std::mem::take(&mut *merged.lock());
        self.metrics.record_aggregation(skipped.len());
        tracing::info!(partitions = partitions.len(), skipped = skipped.len(), "aggregation complete");

        Ok(Dashboard { partitions, skipped })
    }

    /// Handles a finished partition task.
    fn settle(
        &self,
        joined: Result<(Id, StorageResult<()>), JoinError>,
        owners: &mut HashMap<Id, Partition>,
        skipped: &mut Vec<SkippedPartition>,
    ) -> EngineResult<()> {
        let (id, err) = match joined {
            Ok((id, Ok(()))) => {
                owners.remove(&id);
                return Ok(());
            },
            Ok((id, Err(err))) => (id, err),
            Err(join_err) => (join_err.id(), StorageError::internal_with_source("aggregation task failed", join_err)),
        };
        match owners.remove(&id) {
            Some(partition) => self.fail(partition, err, skipped),
            None => Ok(()),
        }
    }

    /// Applies the failure policy to one partition.
    fn fail(&self, partition: Partition, err: StorageError, skipped: &mut Vec<SkippedPartition>) -> EngineResult<()> {
        match self.config.failure_policy {
            FailurePolicy::Abort => {
                tracing::warn!(partition = %partition, error = %err, "aggregation aborted");
                self.metrics.record_error();
                Err(EngineError::query(err))
            },
            FailurePolicy::SkipPartition => {
                tracing::warn!(partition = %partition, error = %err, "partial aggregation failure, partition skipped");
                skipped.push(SkippedPartition { partition, reason: err.to_string() });
                Ok(())
            },
        }
    }

    /// Builds the dashboard of one partition.
    ///
    /// `None` selects the first partition. When no partition exists the
    /// detail is empty apart from `days`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Query`] if any query fails or the deadline
    /// elapses.
    #[tracing::instrument(
        skip_all,
        fields(partition = partition.as_ref().map(Partition::as_str), days = window.span_days())
    )]
    pub async fn partition_detail(
        &self,
        partition: Option<Partition>,
        window: Window,
    ) -> EngineResult<PartitionDetail> {
        let deadline = Instant::now() + self.config.deadline;
        let hostnames =
            bounded_until(deadline, &self.metrics, self.store.list_partitions()).await.map_err(EngineError::query)?;

        let hostname = partition.or_else(|| hostnames.first().cloned());
        let mut detail = PartitionDetail {
            hostname: hostname.clone(),
            days: window.span_days(),
            hostnames,
            ..PartitionDetail::default()
        };
        let Some(hostname) = hostname else {
            return Ok(detail);
        };

        self.readiness.ensure_once(&hostname);
        let since = window.since(Utc::now());
        let (timeseries, groups) = tokio::try_join!(
            bounded_until(deadline, &self.metrics, self.store.daily_counts(&hostname, since)),
            bounded_until(deadline, &self.metrics, self.store.group_by_path_client(&hostname, since)),
        )
        .map_err(EngineError::query)?;

        detail.paths = fold_by_path(&groups);
        detail.summary = DetailSummary {
            total_pv: detail.paths.iter().map(|r| r.pv).sum(),
            total_uv: detail.paths.iter().map(|r| r.uv).sum(),
        };
        detail.timeseries = timeseries;

        tracing::debug!(
            paths = detail.paths.len(),
            days_with_visits = detail.timeseries.len(),
            "partition detail built"
        );
        Ok(detail)
    }
}

impl<S: ?Sized> std::fmt::Debug for Aggregator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").field("config", &self.config).finish_non_exhaustive()
    }
}
