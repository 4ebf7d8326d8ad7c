//! The assembled statistics engine.

use std::sync::Arc;

use visitstat_storage::{Metrics, MetricsSnapshot, Partition, VisitCount, VisitStore};

use crate::{
    aggregate::{Aggregator, Dashboard, PartitionDetail, Window},
    cleanup::{Cleaner, CleanupReport},
    config::EngineConfig,
    counter::{Counter, Scope},
    error::EngineResult,
    ingest::{IngestOutcome, Ingestor, VisitRequest},
    origin::OriginPolicy,
    readiness::{ReadinessManager, ReadinessState, ReadinessTransition},
    report::{ReportSelection, StatReport},
};

/// Every engine component wired to one store, one readiness manager and
/// one metrics collector.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use visitstat_engine::{AllowList, EngineConfig, ReportSelection, VisitRequest, VisitStats};
/// use visitstat_storage::MemoryVisitStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let stats = VisitStats::new(
///     Arc::new(MemoryVisitStore::new()),
///     Arc::new(AllowList::new(true, ["https://blog.example.com"])),
///     EngineConfig::default(),
/// )?;
///
/// let request = VisitRequest::builder()
///     .declared_url("https://blog.example.com/posts/1")
///     .client_address("203.0.113.7")
///     .build();
/// let (outcome, report) = stats.record_and_report(&request, ReportSelection::PAGE_AND_SITE).await?;
///
/// assert!(outcome.is_new);
/// assert_eq!((report.page_pv, report.site_pv), (1, Some(1)));
/// stats.shutdown().await;
/// # Ok::<(), visitstat_engine::EngineError>(())
/// # }).unwrap();
/// ```
pub struct VisitStats<S: ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
    readiness: Arc<ReadinessManager<S>>,
    ingestor: Ingestor<S>,
    counter: Counter<S>,
    aggregator: Aggregator<S>,
    cleaner: Cleaner<S>,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized + 'static> VisitStats<S> {
    /// Wires the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`](crate::EngineError::Config) if
    /// `config` is invalid.
    pub fn new(store: Arc<S>, policy: Arc<dyn OriginPolicy>, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let metrics = Metrics::new();
        let readiness =
            Arc::new(ReadinessManager::new(Arc::clone(&store), config.readiness.clone(), metrics.clone()));
        Ok(Self {
            ingestor: Ingestor::new(
                Arc::clone(&store),
                policy,
                Arc::clone(&readiness),
                config.insert_timeout,
                metrics.clone(),
            ),
            counter: Counter::new(Arc::clone(&store), config.count_timeout, metrics.clone()),
            aggregator: Aggregator::new(
                Arc::clone(&store),
                Arc::clone(&readiness),
                config.aggregation.clone(),
                metrics.clone(),
            ),
            cleaner: Cleaner::new(Arc::clone(&store), config.cleanup.clone(), metrics.clone()),
            store,
            config,
            readiness,
            metrics,
        })
    }

    /// Wires the engine, waits for the store and schedules index readiness
    /// for every existing partition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`](crate::EngineError::Unavailable)
    /// if the store stays unreachable, plus the errors of [`new`](Self::new).
    pub async fn start(store: Arc<S>, policy: Arc<dyn OriginPolicy>, config: EngineConfig) -> EngineResult<Self> {
        let stats = Self::new(store, policy, config)?;
        stats.readiness.prepare_existing(&stats.config.connectivity).await?;
        Ok(stats)
    }

    /// Records one visit. See [`Ingestor::record`].
    ///
    /// # Errors
    ///
    /// See [`Ingestor::record`].
    pub async fn record(&self, request: &VisitRequest) -> EngineResult<IngestOutcome> {
        self.ingestor.record(request).await
    }

    /// Records one visit and returns the updated counts of its page, and of
    /// its site when `selection` asks for them.
    ///
    /// # Errors
    ///
    /// The errors of [`record`](Self::record), then
    /// [`EngineError::Query`](crate::EngineError::Query) if a count fails.
    /// The visit stays recorded when a count fails.
    pub async fn record_and_report(
        &self,
        request: &VisitRequest,
        selection: ReportSelection,
    ) -> EngineResult<(IngestOutcome, StatReport)> {
        let outcome = self.ingestor.record(request).await?;

        let page = self.counter.count(&outcome.partition, &Scope::page(outcome.path.as_str())).await?;
        let mut report = StatReport { page_pv: page.pv, page_uv: page.uv, ..StatReport::default() };
        if selection.site {
            let site = self.counter.count(&outcome.partition, &Scope::Site).await?;
            report.site_pv = Some(site.pv);
            report.site_uv = Some(site.uv);
        }
        Ok((outcome, report))
    }

    /// Counts visits of `scope` in `partition`.
    ///
    /// # Errors
    ///
    /// See [`Counter::count`].
    pub async fn count(&self, partition: &Partition, scope: &Scope) -> EngineResult<VisitCount> {
        self.counter.count(partition, scope).await
    }

    /// Aggregates every partition. See [`Aggregator::summarize`].
    ///
    /// # Errors
    ///
    /// See [`Aggregator::summarize`].
    pub async fn summarize(&self, window: Window) -> EngineResult<Dashboard> {
        self.aggregator.summarize(window).await
    }

    /// Builds one partition's dashboard. See [`Aggregator::partition_detail`].
    ///
    /// # Errors
    ///
    /// See [`Aggregator::partition_detail`].
    pub async fn partition_detail(
        &self,
        partition: Option<Partition>,
        window: Window,
    ) -> EngineResult<PartitionDetail> {
        self.aggregator.partition_detail(partition, window).await
    }

    /// Deletes low-signal groups and returns the number of deleted visits.
    ///
    /// # Errors
    ///
    /// See [`Cleaner::run`].
    pub async fn cleanup(&self) -> EngineResult<u64> {
        self.cleaner.cleanup().await
    }

    /// Like [`cleanup`](Self::cleanup) but returns the full report.
    ///
    /// # Errors
    ///
    /// See [`Cleaner::run`].
    pub async fn cleanup_report(&self) -> EngineResult<CleanupReport> {
        self.cleaner.run().await
    }

    /// Readiness of `partition`.
    #[must_use]
    pub fn readiness_state(&self, partition: &Partition) -> ReadinessState {
        self.readiness.state(partition)
    }

    /// Subscribes to readiness transitions.
    #[must_use]
    pub fn subscribe_readiness(&self) -> tokio::sync::broadcast::Receiver<ReadinessTransition> {
        self.readiness.subscribe()
    }

    /// The readiness manager shared by every component.
    #[must_use]
    pub fn readiness(&self) -> &Arc<ReadinessManager<S>> {
        &self.readiness
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current metric values.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancels background readiness work and waits for it to stop.
    pub async fn shutdown(&self) {
        self.readiness.shutdown().await;
        self.metrics.log_metrics();
    }
}

impl<S: ?Sized> std::fmt::Debug for VisitStats<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitStats")
            .field("config", &self.config)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}
