//! Shared test utilities for visit store testing.
//!
//! This module provides helpers for building visits, pre-populated stores,
//! a fault-injecting [`FlakyStore`] wrapper, and assertion macros over
//! [`StorageResult`] values. It is feature-gated behind `testutil` to
//! prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! visitstat-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use visitstat_storage::testutil::{FlakyStore, populated_store, visit_at};
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::{
    backend::VisitStore,
    error::{StorageError, StorageResult},
    health::{HealthProbe, HealthStatus},
    memory::MemoryVisitStore,
    types::{DailyStat, Partition, PathClientCount, PathTotal, Visit, VisitCount},
};

/// Visitor id used by every visit built with [`visit_at`].
pub const TEST_VISITOR_ID: &str = "00000000-0000-4000-8000-000000000000";

/// Builds a visit with empty user agent and referrer.
#[must_use]
pub fn visit_at(partition: &str, path: &str, client: &str, occurred_at: DateTime<Utc>) -> Visit {
    Visit {
        partition: Partition::from(partition),
        visitor_id: TEST_VISITOR_ID.into(),
        path: path.to_owned(),
        client_address: client.to_owned(),
        user_agent: String::new(),
        referrer: String::new(),
        occurred_at,
    }
}

/// Builds a visit that occurred `days` days before now.
#[must_use]
pub fn visit_days_ago(partition: &str, path: &str, client: &str, days: i64) -> Visit {
    visit_at(partition, path, client, Utc::now() - ChronoDuration::days(days))
}

/// Creates a [`MemoryVisitStore`] holding one visit per `(partition, path, client)`
/// tuple, all stamped with the current time.
///
/// # Panics
///
/// Panics if any insert fails (should not happen with `MemoryVisitStore`).
pub async fn populated_store(rows: &[(&str, &str, &str)]) -> MemoryVisitStore {
    let store = MemoryVisitStore::new();
    let now = Utc::now();
    for (partition, path, client) in rows {
        store.insert(&visit_at(partition, path, client, now)).await.expect("populate insert failed");
    }
    store
}

/// Inserts `n` visits of `path` from distinct clients `c0..c{n-1}`.
///
/// # Panics
///
/// Panics if any insert fails.
pub async fn insert_spread<S: VisitStore + ?Sized>(store: &S, partition: &str, path: &str, n: usize) {
    let now = Utc::now();
    for i in 0..n {
        let visit = visit_at(partition, path, &format!("c{i}"), now);
        store.insert(&visit).await.expect("insert failed");
    }
}

#[derive(Debug, Default)]
struct Faults {
    ensure_failures_remaining: u32,
    ensure_always_fails: bool,
    ensure_fails_permanently: bool,
    ensure_delay: Option<Duration>,
    failing_partitions: BTreeSet<Partition>,
    slow_partitions: BTreeMap<Partition, Duration>,
    inserts_fail: bool,
    counts_fail: bool,
    count_delay: Option<Duration>,
    list_fails: bool,
    totals_fail: bool,
    health_failures_remaining: u32,
    before_delete: Vec<Visit>,
}

#[derive(Debug, Default)]
struct CallCounts {
    insert: AtomicU64,
    count: AtomicU64,
    group: AtomicU64,
    group_in_flight: AtomicU64,
    group_peak: AtomicU64,
    ensure: AtomicU64,
    delete: AtomicU64,
    health: AtomicU64,
}

/// Fault-injecting wrapper around any [`VisitStore`].
///
/// Every fault is off by default, so a fresh `FlakyStore` behaves exactly
/// like the store it wraps. Faults are toggled through `&self` methods so
/// a test can reconfigure a store it already handed to the engine.
///
/// Injected errors are [`StorageError::Connection`] and therefore transient,
/// except for [`fail_ensure_permanently`](Self::fail_ensure_permanently).
///
/// # Examples
///
/// ```no_run
/// use visitstat_storage::{MemoryVisitStore, testutil::FlakyStore};
///
/// let store = FlakyStore::new(MemoryVisitStore::new());
/// store.fail_ensure_times(2);
/// ```
#[derive(Clone)]
pub struct FlakyStore<S> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
    calls: Arc<CallCounts>,
}

impl<S: VisitStore> FlakyStore<S> {
    /// Wraps `inner` with every fault disabled.
    pub fn new(inner: S) -> Self {
        Self { inner, faults: Arc::default(), calls: Arc::default() }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Makes the next `n` `ensure_indexes` calls fail.
    pub fn fail_ensure_times(&self, n: u32) {
        self.faults.lock().ensure_failures_remaining = n;
    }

    /// Makes every `ensure_indexes` call fail until [`heal`](Self::heal).
    pub fn fail_ensure_always(&self) {
        self.faults.lock().ensure_always_fails = true;
    }

    /// Makes every `ensure_indexes` call fail with a non-transient
    /// [`StorageError::Internal`] until [`heal`](Self::heal).
    pub fn fail_ensure_permanently(&self) {
        self.faults.lock().ensure_fails_permanently = true;
    }

    /// Delays every `ensure_indexes` call.
    pub fn delay_ensure(&self, delay: Duration) {
        self.faults.lock().ensure_delay = Some(delay);
    }

    /// Makes grouped and daily queries against `partition` fail.
    pub fn fail_partition(&self, partition: impl Into<Partition>) {
        self.faults.lock().failing_partitions.insert(partition.into());
    }

    /// Delays grouped and daily queries against `partition`.
    pub fn delay_partition(&self, partition: impl Into<Partition>, delay: Duration) {
        self.faults.lock().slow_partitions.insert(partition.into(), delay);
    }

    /// Makes every insert fail.
    pub fn fail_inserts(&self) {
        self.faults.lock().inserts_fail = true;
    }

    /// Makes every count fail.
    pub fn fail_counts(&self) {
        self.faults.lock().counts_fail = true;
    }

    /// Delays every count.
    pub fn delay_counts(&self, delay: Duration) {
        self.faults.lock().count_delay = Some(delay);
    }

    /// Makes `list_partitions` fail.
    pub fn fail_list(&self) {
        self.faults.lock().list_fails = true;
    }

    /// Makes `path_totals` fail.
    pub fn fail_totals(&self) {
        self.faults.lock().totals_fail = true;
    }

    /// Makes the next `n` health checks fail.
    pub fn fail_health_times(&self, n: u32) {
        self.faults.lock().health_failures_remaining = n;
    }

    /// Inserts `visits` into the wrapped store right before the first
    /// subsequent `delete_group_below` runs, simulating ingestion racing
    /// with cleanup.
    pub fn insert_before_delete(&self, visits: Vec<Visit>) {
        self.faults.lock().before_delete = visits;
    }

    /// Disables every fault.
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Number of `insert` calls observed.
    pub fn insert_calls(&self) -> u64 {
        self.calls.insert.load(Ordering::SeqCst)
    }

    /// Number of `count` calls observed.
    pub fn count_calls(&self) -> u64 {
        self.calls.count.load(Ordering::SeqCst)
    }

    /// Number of `group_by_path_client` calls observed.
    pub fn group_calls(&self) -> u64 {
        self.calls.group.load(Ordering::SeqCst)
    }

    /// Largest number of `group_by_path_client` calls that were running
    /// at the same time.
    pub fn peak_group_in_flight(&self) -> u64 {
        self.calls.group_peak.load(Ordering::SeqCst)
    }

    /// Number of `ensure_indexes` calls observed.
    pub fn ensure_calls(&self) -> u64 {
        self.calls.ensure.load(Ordering::SeqCst)
    }

    /// Number of `delete_group_below` calls observed.
    pub fn delete_calls(&self) -> u64 {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Number of `health_check` calls observed.
    pub fn health_calls(&self) -> u64 {
        self.calls.health.load(Ordering::SeqCst)
    }

    async fn partition_faults(&self, partition: &Partition) -> StorageResult<()> {
        let (fails, delay) = {
            let faults = self.faults.lock();
            (faults.failing_partitions.contains(partition), faults.slow_partitions.get(partition).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(StorageError::connection(format!("injected failure for {partition}")));
        }
        Ok(())
    }
}

/// Counts a running grouped query; released on drop so a cancelled query
/// leaves the gauge too.
struct InFlight<'a> {
    calls: &'a CallCounts,
}

impl<'a> InFlight<'a> {
    fn enter(calls: &'a CallCounts) -> Self {
        let now = calls.group_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        calls.group_peak.fetch_max(now, Ordering::SeqCst);
        Self { calls }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.calls.group_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S> std::fmt::Debug for FlakyStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore").field("faults", &*self.faults.lock()).finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: VisitStore> VisitStore for FlakyStore<S> {
    async fn insert(&self, visit: &Visit) -> StorageResult<()> {
        self.calls.insert.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().inserts_fail {
            return Err(StorageError::connection("injected insert failure"));
        }
        self.inner.insert(visit).await
    }

    async fn list_partitions(&self) -> StorageResult<Vec<Partition>> {
        if self.faults.lock().list_fails {
            return Err(StorageError::connection("injected list failure"));
        }
        self.inner.list_partitions().await
    }

    async fn count(&self, partition: &Partition, path: Option<&str>) -> StorageResult<VisitCount> {
        self.calls.count.fetch_add(1, Ordering::SeqCst);
        let (fails, delay) = {
            let faults = self.faults.lock();
            (faults.counts_fail, faults.count_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(StorageError::connection("injected count failure"));
        }
        self.inner.count(partition, path).await
    }

    async fn group_by_path_client(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<PathClientCount>> {
        self.calls.group.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.calls);
        self.partition_faults(partition).await?;
        self.inner.group_by_path_client(partition, since).await
    }

    async fn daily_counts(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DailyStat>> {
        self.partition_faults(partition).await?;
        self.inner.daily_counts(partition, since).await
    }

    async fn path_totals(&self) -> StorageResult<Vec<PathTotal>> {
        if self.faults.lock().totals_fail {
            return Err(StorageError::connection("injected totals failure"));
        }
        self.inner.path_totals().await
    }

    async fn delete_group_below(
        &self,
        partition: &Partition,
        path: &str,
        threshold: u64,
    ) -> StorageResult<u64> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        let racing = std::mem::take(&mut self.faults.lock().before_delete);
        for visit in &racing {
            self.inner.insert(visit).await?;
        }
        self.inner.delete_group_below(partition, path, threshold).await
    }

    async fn ensure_indexes(&self, partition: &Partition) -> StorageResult<()> {
        self.calls.ensure.fetch_add(1, Ordering::SeqCst);
        let (fails, permanent, delay) = {
            let mut faults = self.faults.lock();
            let fails = if faults.ensure_always_fails {
                true
            } else if faults.ensure_failures_remaining > 0 {
                faults.ensure_failures_remaining -= 1;
                true
            } else {
                false
            };
            (fails, faults.ensure_fails_permanently, faults.ensure_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if permanent {
            return Err(StorageError::internal(format!("injected permanent ensure failure for {partition}")));
        }
        if fails {
            return Err(StorageError::connection(format!("injected ensure failure for {partition}")));
        }
        self.inner.ensure_indexes(partition).await
    }

    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        self.calls.health.fetch_add(1, Ordering::SeqCst);
        let fails = {
            let mut faults = self.faults.lock();
            if faults.health_failures_remaining > 0 {
                faults.health_failures_remaining -= 1;
                true
            } else {
                false
            }
        };
        if fails {
            return Err(StorageError::connection("injected health failure"));
        }
        self.inner.health_check(probe).await
    }
}

/// Assert that a [`StorageResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use visitstat_storage::{StorageResult, assert_storage_ok};
///
/// let result: StorageResult<i32> = Ok(42);
/// let value = assert_storage_ok!(result);
/// assert_eq!(value, 42);
/// ```
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::Connection`].
#[macro_export]
macro_rules! assert_connection_error {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Connection { .. })),
            "expected StorageError::Connection, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] contains a [`StorageError::Timeout`].
#[macro_export]
macro_rules! assert_timeout {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Timeout)),
            "expected StorageError::Timeout, got: {:?}",
            $result,
        );
    };
}
