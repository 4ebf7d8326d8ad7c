//! Per-partition index readiness.
//!
//! Partitions are created implicitly by their first visit, so their
//! secondary indexes are created lazily too. The [`ReadinessManager`]
//! tracks one state per partition:
//!
//! ```text
//!              ensure_once            success
//!   Unknown ──────────────▶ Ensuring ─────────▶ Ready
//!      ▲                       │
//!      │                       │ attempts exhausted / deadline
//!      └──────── Failed ◀──────┘
//! ```
//!
//! At most one ensure procedure runs per partition. Procedures run as
//! detached tasks owned by the manager: they can be observed through
//! [`subscribe`](ReadinessManager::subscribe) and cancelled with
//! [`shutdown`](ReadinessManager::shutdown). Failures are logged and never
//! reach the request that triggered them.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use visitstat_storage::{Metrics, Partition, StorageResult, VisitStore};

use crate::{
    config::{ConnectivityConfig, ReadinessConfig},
    connectivity::wait_for_connectivity,
    error::{EngineError, EngineResult},
    timeout::bounded,
};

/// Buffered transitions per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 256;

/// Index readiness of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    /// No procedure has succeeded and none is running.
    Unknown,
    /// A procedure is running.
    Ensuring,
    /// Indexes exist.
    Ready,
    /// The last procedure gave up. Immediately followed by `Unknown`.
    Failed,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Ensuring => write!(f, "ensuring"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A state change published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTransition {
    /// The partition that changed.
    pub partition: Partition,
    /// Its new state.
    pub state: ReadinessState,
}

/// Owns the readiness table and the ensure procedures.
///
/// Share it as `Arc<ReadinessManager<S>>`; [`ensure_once`](Self::ensure_once)
/// needs the `Arc` to hand a reference to the spawned procedure.
pub struct ReadinessManager<S: ?Sized> {
    store: Arc<S>,
    config: ReadinessConfig,
    /// Partitions absent from the table are `Unknown`.
    states: Mutex<HashMap<Partition, ReadinessState>>,
    events: broadcast::Sender<ReadinessTransition>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    runs: AtomicU64,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized + 'static> ReadinessManager<S> {
    /// Creates a manager with every partition `Unknown`.
    pub fn new(store: Arc<S>, config: ReadinessConfig, metrics: Metrics) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            config,
            states: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runs: AtomicU64::new(0),
            metrics,
        }
    }

    /// Starts the ensure procedure for `partition` unless it is already
    /// `Ready` or `Ensuring`.
    ///
    /// Never waits for the procedure. Returns `true` if one was started.
    /// After [`shutdown`](Self::shutdown) nothing is started.
    pub fn ensure_once(self: &Arc<Self>, partition: &Partition) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        {
            let mut states = self.states.lock();
            if matches!(states.get(partition), Some(ReadinessState::Ready | ReadinessState::Ensuring)) {
                return false;
            }
            states.insert(partition.clone(), ReadinessState::Ensuring);
            self.publish(partition, ReadinessState::Ensuring);
        }

        let manager = Arc::clone(self);
        let partition = partition.clone();
        self.tracker.spawn(async move { manager.run_procedure(partition).await });
        true
    }

    #[tracing::instrument(name = "ensure_partition", skip_all, fields(partition = %partition))]
    async fn run_procedure(self: Arc<Self>, partition: Partition) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_readiness_run();

        let outcome = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.config.deadline, self.attempt(&partition)) => Some(result),
        };

        match outcome {
            Some(Ok(Ok(attempts))) => {
                let mut states = self.states.lock();
                states.insert(partition.clone(), ReadinessState::Ready);
                self.publish(&partition, ReadinessState::Ready);
                tracing::info!(attempts, "partition indexes ready");
            },
            Some(Ok(Err(err))) => {
                self.give_up(&partition, &err.to_string());
            },
            Some(Err(_)) => {
                self.give_up(&partition, "deadline elapsed");
            },
            None => {
                let mut states = self.states.lock();
                states.remove(&partition);
                self.publish(&partition, ReadinessState::Unknown);
                tracing::debug!("ensure procedure cancelled");
            },
        }
    }

    /// Calls `ensure_indexes` until it succeeds, attempts run out, or the
    /// store reports an error that retrying cannot fix.
    async fn attempt(&self, partition: &Partition) -> StorageResult<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.ensure_indexes(partition).await {
                Ok(()) => return Ok(attempt),
                Err(err) if attempt >= self.config.max_attempts || !err.is_transient() => return Err(err),
                Err(err) => {
                    let delay = self.config.delay_after(attempt);
                    tracing::debug!(
                        operation = "ensure_indexes",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ensure_indexes failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    fn give_up(&self, partition: &Partition, reason: &str) {
        self.metrics.record_readiness_failure();
        tracing::warn!(
            max_attempts = self.config.max_attempts,
            reason,
            "partition indexes could not be ensured"
        );
        let mut states = self.states.lock();
        states.remove(partition);
        self.publish(partition, ReadinessState::Failed);
        self.publish(partition, ReadinessState::Unknown);
    }

    /// Sends a transition. Callers hold the table lock so subscribers see
    /// transitions in table order.
    fn publish(&self, partition: &Partition, state: ReadinessState) {
        // No subscribers is fine.
        let _ = self.events.send(ReadinessTransition { partition: partition.clone(), state });
    }

    /// Returns the current state of `partition`.
    #[must_use]
    pub fn state(&self, partition: &Partition) -> ReadinessState {
        self.states.lock().get(partition).copied().unwrap_or(ReadinessState::Unknown)
    }

    /// Receives every transition published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReadinessTransition> {
        self.events.subscribe()
    }

    /// Number of ensure procedures started so far.
    #[must_use]
    pub fn ensure_runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Waits for connectivity, then starts the ensure procedure for every
    /// existing partition. Returns how many procedures were started.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] if the store stays unreachable
    /// and [`EngineError::Query`] if partitions cannot be listed.
    #[tracing::instrument(skip_all)]
    pub async fn prepare_existing(self: &Arc<Self>, connectivity: &ConnectivityConfig) -> EngineResult<usize> {
        wait_for_connectivity(self.store.as_ref(), connectivity).await?;

        let partitions = bounded(connectivity.probe_timeout, &self.metrics, self.store.list_partitions())
            .await
            .map_err(EngineError::query)?;

        let started = partitions.iter().filter(|p| self.ensure_once(p)).count();
        tracing::info!(partitions = partitions.len(), started, "readiness startup pass scheduled");
        Ok(started)
    }

    /// Cancels running procedures and waits for them to stop.
    ///
    /// Cancelled partitions return to `Unknown`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the cancellation token stopping the procedures.
    ///
    /// Callers can use this to integrate with external shutdown signals.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl<S: ?Sized> fmt::Debug for ReadinessManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessManager")
            .field("config", &self.config)
            .field("partitions", &self.states.lock().len())
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use visitstat_storage::{MemoryVisitStore, testutil::FlakyStore};

    use super::*;

    type Manager = ReadinessManager<FlakyStore<MemoryVisitStore>>;

    fn manager(store: &FlakyStore<MemoryVisitStore>, config: ReadinessConfig) -> Arc<Manager> {
        Arc::new(ReadinessManager::new(Arc::new(store.clone()), config, Metrics::new()))
    }

    fn fast_config() -> ReadinessConfig {
        ReadinessConfig::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(10))
            .deadline(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    /// Collects transitions for `partition` until it settles in `Ready` or
    /// falls back to `Unknown`.
    async fn settle(
        rx: &mut broadcast::Receiver<ReadinessTransition>,
        partition: &Partition,
    ) -> Vec<ReadinessState> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("channel open");
            if &event.partition != partition {
                continue;
            }
            seen.push(event.state);
            if matches!(event.state, ReadinessState::Ready | ReadinessState::Unknown) {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_success_reaches_ready() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        assert_eq!(manager.state(&partition), ReadinessState::Unknown);
        assert!(manager.ensure_once(&partition));

        let seen = settle(&mut rx, &partition).await;
        assert_eq!(seen, [ReadinessState::Ensuring, ReadinessState::Ready]);
        assert_eq!(manager.state(&partition), ReadinessState::Ready);
        assert!(store.inner().is_indexed(&partition));
    }

    #[tokio::test]
    async fn test_ready_partition_is_not_ensured_again() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        manager.ensure_once(&partition);
        settle(&mut rx, &partition).await;

        assert!(!manager.ensure_once(&partition));
        assert_eq!(manager.ensure_runs(), 1);
        assert_eq!(store.ensure_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_start_one_procedure() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.delay_ensure(Duration::from_millis(50));
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        let started: Vec<bool> = (0..10).map(|_| manager.ensure_once(&partition)).collect();
        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert_eq!(manager.state(&partition), ReadinessState::Ensuring);

        settle(&mut rx, &partition).await;
        assert_eq!(manager.ensure_runs(), 1);
        assert_eq!(store.ensure_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_linear_backoff() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_ensure_times(2);
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        let start = tokio::time::Instant::now();
        manager.ensure_once(&partition);
        let seen = settle(&mut rx, &partition).await;

        assert_eq!(seen.last(), Some(&ReadinessState::Ready));
        assert_eq!(store.ensure_calls(), 3);
        // 1 × 10ms after the first failure, 2 × 10ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_fall_back_to_unknown() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_ensure_always();
        let metrics = Metrics::new();
        let manager = Arc::new(ReadinessManager::new(Arc::new(store.clone()), fast_config(), metrics.clone()));
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        manager.ensure_once(&partition);
        let seen = settle(&mut rx, &partition).await;

        assert_eq!(seen, [ReadinessState::Ensuring, ReadinessState::Failed, ReadinessState::Unknown]);
        assert_eq!(manager.state(&partition), ReadinessState::Unknown);
        assert_eq!(store.ensure_calls(), 3);
        assert_eq!(metrics.snapshot().readiness_failures, 1);

        store.heal();
        assert!(manager.ensure_once(&partition), "a failed partition is retried on the next request");
        let seen = settle(&mut rx, &partition).await;
        assert_eq!(seen.last(), Some(&ReadinessState::Ready));
        assert_eq!(manager.ensure_runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_ensure_permanently();
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        manager.ensure_once(&partition);
        let seen = settle(&mut rx, &partition).await;

        assert_eq!(seen, [ReadinessState::Ensuring, ReadinessState::Failed, ReadinessState::Unknown]);
        assert_eq!(store.ensure_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_slow_procedure() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.delay_ensure(Duration::from_secs(60));
        let config = ReadinessConfig::builder().deadline(Duration::from_secs(1)).build().unwrap();
        let manager = manager(&store, config);
        let partition = Partition::from("a.com");
        let mut rx = manager.subscribe();

        manager.ensure_once(&partition);
        let seen = settle(&mut rx, &partition).await;

        assert_eq!(seen, [ReadinessState::Ensuring, ReadinessState::Failed, ReadinessState::Unknown]);
        assert!(!store.inner().is_indexed(&partition));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_procedures() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.delay_ensure(Duration::from_secs(60));
        let manager = manager(&store, fast_config());
        let partition = Partition::from("a.com");

        assert!(manager.ensure_once(&partition));
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert_eq!(manager.state(&partition), ReadinessState::Unknown);
        assert!(!manager.ensure_once(&partition), "nothing starts after shutdown");
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        let manager = manager(&store, fast_config());
        let a = Partition::from("a.com");
        let b = Partition::from("b.com");
        let mut rx = manager.subscribe();

        assert!(manager.ensure_once(&a));
        assert!(manager.ensure_once(&b));
        settle(&mut rx, &a).await;

        let mut rx = manager.subscribe();
        if manager.state(&b) != ReadinessState::Ready {
            settle(&mut rx, &b).await;
        }
        assert_eq!(manager.ensure_runs(), 2);
    }

    #[tokio::test]
    async fn test_prepare_existing_schedules_every_partition() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        visitstat_storage::testutil::insert_spread(store.inner(), "a.com", "/", 1).await;
        visitstat_storage::testutil::insert_spread(store.inner(), "b.com", "/", 1).await;
        let manager = manager(&store, fast_config());

        let started = manager.prepare_existing(&ConnectivityConfig::default()).await.expect("prepare");
        assert_eq!(started, 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_existing_fails_when_unreachable() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_health_times(u32::MAX);
        let manager = manager(&store, fast_config());
        let connectivity = ConnectivityConfig::builder().max_attempts(2).build().unwrap();

        let err = manager.prepare_existing(&connectivity).await.expect_err("unreachable");
        assert!(matches!(err, EngineError::Unavailable { attempts: 2, .. }));
    }
}
