//! Engine-wide counters for visit recording and reporting.
//!
//! [`Metrics`] is a cheaply cloneable handle over a set of atomic counters.
//! The engine records into it from every component; operators read it
//! through [`Metrics::snapshot`] or emit it with [`Metrics::log_metrics`].
//!
//! # Memory Ordering
//!
//! All atomic operations use `Ordering::Relaxed`. Each counter is
//! independent and monotonically increasing, so a snapshot may show one
//! counter slightly ahead of another. Telemetry consumers aggregate over
//! time and do not depend on cross-counter ordering.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use visitstat_storage::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_insert(Duration::from_micros(120));
//! metrics.record_cleanup(3);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.insert_count, 1);
//! assert_eq!(snapshot.cleanup_deleted, 3);
//! assert_eq!(snapshot.avg_insert_latency_us(), 120.0);
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tracing::warn;

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct MetricsSnapshot {
    /// Visits recorded.
    #[builder(default)]
    pub insert_count: u64,
    /// Cumulative insert latency in microseconds.
    #[builder(default)]
    pub insert_latency_us: u64,
    /// Counter queries answered.
    #[builder(default)]
    pub count_count: u64,
    /// Cumulative count latency in microseconds.
    #[builder(default)]
    pub count_latency_us: u64,
    /// Dashboard aggregations completed.
    #[builder(default)]
    pub aggregation_count: u64,
    /// Partitions left out of a dashboard because their query failed.
    #[builder(default)]
    pub partitions_skipped: u64,
    /// Visits deleted by cleanup.
    #[builder(default)]
    pub cleanup_deleted: u64,
    /// Cleanup passes completed.
    #[builder(default)]
    pub cleanup_runs: u64,
    /// Readiness procedures started.
    #[builder(default)]
    pub readiness_runs: u64,
    /// Readiness procedures that gave up.
    #[builder(default)]
    pub readiness_failures: u64,
    /// Failed operations of any kind.
    #[builder(default)]
    pub error_count: u64,
    /// Operations that hit their time limit.
    #[builder(default)]
    pub timeout_count: u64,
}

impl MetricsSnapshot {
    /// Average insert latency in microseconds.
    #[must_use]
    pub fn avg_insert_latency_us(&self) -> f64 {
        average(self.insert_latency_us, self.insert_count)
    }

    /// Average count latency in microseconds.
    #[must_use]
    pub fn avg_count_latency_us(&self) -> f64 {
        average(self.count_latency_us, self.count_count)
    }

    /// Sum of all request-level operations.
    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.insert_count + self.count_count + self.aggregation_count + self.cleanup_runs
    }

    /// Errors as a fraction of all operations.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.total_operations() + self.error_count;
        if total == 0 { 0.0 } else { self.error_count as f64 / total as f64 }
    }
}

fn average(total_us: u64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { total_us as f64 / count as f64 }
}

/// Atomic metrics collector shared by every engine component.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    insert_count: AtomicU64,
    insert_latency_us: AtomicU64,
    count_count: AtomicU64,
    count_latency_us: AtomicU64,
    aggregation_count: AtomicU64,
    partitions_skipped: AtomicU64,
    cleanup_deleted: AtomicU64,
    cleanup_runs: AtomicU64,
    readiness_runs: AtomicU64,
    readiness_failures: AtomicU64,
    error_count: AtomicU64,
    timeout_count: AtomicU64,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl Metrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful insert and its latency.
    pub fn record_insert(&self, duration: Duration) {
        self.inner.insert_count.fetch_add(1, Ordering::Relaxed);
        self.inner.insert_latency_us.fetch_add(micros(duration), Ordering::Relaxed);
    }

    /// Records a successful count query and its latency.
    pub fn record_count(&self, duration: Duration) {
        self.inner.count_count.fetch_add(1, Ordering::Relaxed);
        self.inner.count_latency_us.fetch_add(micros(duration), Ordering::Relaxed);
    }

    /// Records a completed dashboard aggregation.
    pub fn record_aggregation(&self, skipped: usize) {
        self.inner.aggregation_count.fetch_add(1, Ordering::Relaxed);
        self.inner.partitions_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    /// Records a completed cleanup pass.
    pub fn record_cleanup(&self, deleted: u64) {
        self.inner.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.inner.cleanup_deleted.fetch_add(deleted, Ordering::Relaxed);
    }

    /// Records the start of a readiness procedure.
    pub fn record_readiness_run(&self) {
        self.inner.readiness_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a readiness procedure that gave up.
    pub fn record_readiness_failure(&self) {
        self.inner.readiness_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed operation.
    pub fn record_error(&self) {
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that exceeded its time limit.
    ///
    /// Timeouts also count as errors.
    pub fn record_timeout(&self) {
        self.inner.timeout_count.fetch_add(1, Ordering::Relaxed);
        self.record_error();
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            insert_count: inner.insert_count.load(Ordering::Relaxed),
            insert_latency_us: inner.insert_latency_us.load(Ordering::Relaxed),
            count_count: inner.count_count.load(Ordering::Relaxed),
            count_latency_us: inner.count_latency_us.load(Ordering::Relaxed),
            aggregation_count: inner.aggregation_count.load(Ordering::Relaxed),
            partitions_skipped: inner.partitions_skipped.load(Ordering::Relaxed),
            cleanup_deleted: inner.cleanup_deleted.load(Ordering::Relaxed),
            cleanup_runs: inner.cleanup_runs.load(Ordering::Relaxed),
            readiness_runs: inner.readiness_runs.load(Ordering::Relaxed),
            readiness_failures: inner.readiness_failures.load(Ordering::Relaxed),
            error_count: inner.error_count.load(Ordering::Relaxed),
            timeout_count: inner.timeout_count.load(Ordering::Relaxed),
        }
    }

    /// Logs current metrics at INFO level, warning on a high error rate.
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();

        if snapshot.total_operations() == 0 {
            return;
        }

        tracing::info!(
            insert_count = snapshot.insert_count,
            count_count = snapshot.count_count,
            avg_insert_latency_us = snapshot.avg_insert_latency_us(),
            avg_count_latency_us = snapshot.avg_count_latency_us(),
            aggregation_count = snapshot.aggregation_count,
            partitions_skipped = snapshot.partitions_skipped,
            cleanup_runs = snapshot.cleanup_runs,
            cleanup_deleted = snapshot.cleanup_deleted,
            readiness_runs = snapshot.readiness_runs,
            readiness_failures = snapshot.readiness_failures,
            error_count = snapshot.error_count,
            timeout_count = snapshot.timeout_count,
            "Visit metrics snapshot"
        );

        if snapshot.error_rate() > 0.05 {
            warn!(
                error_rate = snapshot.error_rate(),
                error_count = snapshot.error_count,
                total_ops = snapshot.total_operations(),
                "High visit store error rate detected"
            );
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();

        clone.record_count(Duration::from_micros(40));
        clone.record_count(Duration::from_micros(60));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count_count, 2);
        assert_eq!(snapshot.avg_count_latency_us(), 50.0);
    }

    #[test]
    fn test_timeout_counts_as_error() {
        let metrics = Metrics::new();
        metrics.record_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timeout_count, 1);
        assert_eq!(snapshot.error_count, 1);
    }

    #[test]
    fn test_aggregation_tracks_skipped_partitions() {
        let metrics = Metrics::new();
        metrics.record_aggregation(0);
        metrics.record_aggregation(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.aggregation_count, 2);
        assert_eq!(snapshot.partitions_skipped, 2);
    }

    #[test]
    fn test_error_rate() {
        let snapshot = MetricsSnapshot::builder().insert_count(9).error_count(1).build();
        assert!((snapshot.error_rate() - 0.1).abs() < f64::EPSILON);
        assert_eq!(MetricsSnapshot::default().error_rate(), 0.0);
    }

    #[test]
    fn test_average_with_no_samples_is_zero() {
        assert_eq!(MetricsSnapshot::default().avg_insert_latency_us(), 0.0);
    }
}
