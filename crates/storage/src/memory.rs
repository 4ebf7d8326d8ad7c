//! In-memory visit store implementation.
//!
//! This module provides [`MemoryVisitStore`], an in-memory implementation of
//! [`VisitStore`] suitable for testing, development, and single-process
//! deployments that do not need durability.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered partitions**: Partitions live in a [`BTreeMap`], so listing is sorted
//! - **Secondary indexes**: [`ensure_indexes`](VisitStore::ensure_indexes) builds per-partition
//!   `(path, client)` and `client` tallies that are maintained on every insert and delete
//! - **Atomic cleanup**: the threshold check and delete of a group run under one write lock
//!
//! # Performance Characteristics
//!
//! | Operation | Unindexed | Indexed |
//! |-----------|-----------|---------|
//! | insert | O(1) | O(log n) |
//! | count (page) | O(n) | O(log n + k) |
//! | count (site) | O(n) | O(c) where c is distinct clients |
//! | group_by_path_client (unbounded) | O(n log n) | O(g) where g is group count |
//!
//! Windowed queries always scan, since the indexes carry no timestamps.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    backend::VisitStore,
    error::{StorageError, StorageResult},
    health::{HealthMetadata, HealthProbe, HealthStatus},
    types::{DailyStat, Partition, PathClientCount, PathTotal, Visit, VisitCount},
};

/// Tallies kept once a partition has been indexed.
#[derive(Debug, Default)]
struct PartitionIndexes {
    /// `(path, client_address)` → visits.
    by_path_client: BTreeMap<(String, String), u64>,
    /// `client_address` → visits.
    by_client: BTreeMap<String, u64>,
}

impl PartitionIndexes {
    fn build(visits: &[Visit]) -> Self {
        let mut indexes = Self::default();
        for visit in visits {
            indexes.add(visit);
        }
        indexes
    }

    fn add(&mut self, visit: &Visit) {
        *self
            .by_path_client
            .entry((visit.path.clone(), visit.client_address.clone()))
            .or_default() += 1;
        *self.by_client.entry(visit.client_address.clone()).or_default() += 1;
    }

    fn remove(&mut self, visit: &Visit) {
        let key = (visit.path.clone(), visit.client_address.clone());
        if let Some(n) = self.by_path_client.get_mut(&key) {
            *n -= 1;
            if *n == 0 {
                self.by_path_client.remove(&key);
            }
        }
        if let Some(n) = self.by_client.get_mut(&visit.client_address) {
            *n -= 1;
            if *n == 0 {
                self.by_client.remove(&visit.client_address);
            }
        }
    }

    /// Entries of `by_path_client` whose path equals `path`.
    fn path_groups<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        self.by_path_client
            .range((path.to_owned(), String::new())..)
            .take_while(move |((p, _), _)| p == path)
            .map(|((_, client), n)| (client.as_str(), *n))
    }
}

#[derive(Debug, Default)]
struct PartitionData {
    visits: Vec<Visit>,
    indexes: Option<PartitionIndexes>,
}

impl PartitionData {
    fn count(&self, path: Option<&str>) -> VisitCount {
        match (&self.indexes, path) {
            (Some(idx), Some(path)) => {
                let mut count = VisitCount::default();
                for (_, n) in idx.path_groups(path) {
                    count.pv += n;
                    count.uv += 1;
                }
                count
            },
            (Some(idx), None) => {
                VisitCount { pv: idx.by_client.values().sum(), uv: idx.by_client.len() as u64 }
            },
            (None, path) => {
                let mut clients = BTreeSet::new();
                let mut pv = 0;
                for visit in self.visits.iter().filter(|v| path.is_none_or(|p| v.path == p)) {
                    pv += 1;
                    clients.insert(visit.client_address.as_str());
                }
                VisitCount { pv, uv: clients.len() as u64 }
            },
        }
    }
}

/// In-memory visit store.
///
/// # Cloning
///
/// `MemoryVisitStore` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
#[derive(Clone, Default)]
pub struct MemoryVisitStore {
    partitions: Arc<RwLock<BTreeMap<Partition, PartitionData>>>,
}

impl MemoryVisitStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored visits across all partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.read().values().map(|p| p.visits.len()).sum()
    }

    /// Returns `true` if no visits are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`ensure_indexes`](VisitStore::ensure_indexes)
    /// has run for `partition`.
    #[must_use]
    pub fn is_indexed(&self, partition: &Partition) -> bool {
        self.partitions.read().get(partition).is_some_and(|p| p.indexes.is_some())
    }
}

impl std::fmt::Debug for MemoryVisitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryVisitStore")
            .field("partitions", &self.partitions.read().len())
            .finish_non_exhaustive()
    }
}

fn in_window(visit: &Visit, since: Option<DateTime<Utc>>) -> bool {
    since.is_none_or(|since| visit.occurred_at >= since)
}

#[async_trait]
impl VisitStore for MemoryVisitStore {
    #[tracing::instrument(skip_all, fields(partition = %visit.partition))]
    async fn insert(&self, visit: &Visit) -> StorageResult<()> {
        fail_point!("memory-insert", |_| Err(StorageError::connection("insert failpoint")));

        let mut partitions = self.partitions.write();
        let data = partitions.entry(visit.partition.clone()).or_default();
        if let Some(indexes) = data.indexes.as_mut() {
            indexes.add(visit);
        }
        data.visits.push(visit.clone());
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn list_partitions(&self) -> StorageResult<Vec<Partition>> {
        Ok(self.partitions.read().keys().cloned().collect())
    }

    #[tracing::instrument(skip_all, fields(partition = %partition, path = ?path))]
    async fn count(&self, partition: &Partition, path: Option<&str>) -> StorageResult<VisitCount> {
        let partitions = self.partitions.read();
        Ok(partitions.get(partition).map(|data| data.count(path)).unwrap_or_default())
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn group_by_path_client(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<PathClientCount>> {
        let partitions = self.partitions.read();
        let Some(data) = partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let groups = match (&data.indexes, since) {
            (Some(indexes), None) => indexes.by_path_client.clone(),
            _ => {
                let mut groups: BTreeMap<(String, String), u64> = BTreeMap::new();
                for visit in data.visits.iter().filter(|v| in_window(v, since)) {
                    *groups
                        .entry((visit.path.clone(), visit.client_address.clone()))
                        .or_default() += 1;
                }
                groups
            },
        };

        Ok(groups
            .into_iter()
            .map(|((path, client_address), visits)| PathClientCount { path, client_address, visits })
            .collect())
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn daily_counts(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DailyStat>> {
        let partitions = self.partitions.read();
        let Some(data) = partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let mut days: BTreeMap<NaiveDate, (u64, BTreeSet<&str>)> = BTreeMap::new();
        for visit in data.visits.iter().filter(|v| in_window(v, since)) {
            let (pv, clients) = days.entry(visit.occurred_at.date_naive()).or_default();
            *pv += 1;
            clients.insert(visit.client_address.as_str());
        }

        Ok(days
            .into_iter()
            .map(|(date, (pv, clients))| DailyStat { date, pv, uv: clients.len() as u64 })
            .collect())
    }

    #[tracing::instrument(skip_all)]
    async fn path_totals(&self) -> StorageResult<Vec<PathTotal>> {
        let partitions = self.partitions.read();
        let mut totals = Vec::new();
        for (partition, data) in partitions.iter() {
            let mut per_path: BTreeMap<&str, u64> = BTreeMap::new();
            for visit in &data.visits {
                *per_path.entry(visit.path.as_str()).or_default() += 1;
            }
            totals.extend(per_path.into_iter().map(|(path, visits)| PathTotal {
                partition: partition.clone(),
                path: path.to_owned(),
                visits,
            }));
        }
        Ok(totals)
    }

    #[tracing::instrument(skip_all, fields(partition = %partition, path = path, threshold = threshold))]
    async fn delete_group_below(
        &self,
        partition: &Partition,
        path: &str,
        threshold: u64,
    ) -> StorageResult<u64> {
        let mut partitions = self.partitions.write();
        let Some(data) = partitions.get_mut(partition) else {
            return Ok(0);
        };

        let current = data.visits.iter().filter(|v| v.path == path).count() as u64;
        if current == 0 || current >= threshold {
            return Ok(0);
        }

        let (removed, kept): (Vec<Visit>, Vec<Visit>) =
            std::mem::take(&mut data.visits).into_iter().partition(|v| v.path == path);
        data.visits = kept;
        if let Some(indexes) = data.indexes.as_mut() {
            for visit in &removed {
                indexes.remove(visit);
            }
        }
        Ok(removed.len() as u64)
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn ensure_indexes(&self, partition: &Partition) -> StorageResult<()> {
        fail_point!("memory-ensure-indexes", |_| {
            Err(StorageError::connection("ensure indexes failpoint"))
        });

        let mut partitions = self.partitions.write();
        let data = partitions.entry(partition.clone()).or_default();
        if data.indexes.is_none() {
            data.indexes = Some(PartitionIndexes::build(&data.visits));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(probe = %probe))]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        fail_point!("health-check", |_| Err(StorageError::connection("health check failpoint")));

        let start = Instant::now();
        // Acquiring the read lock proves the store is not deadlocked.
        let partition_count = self.partitions.read().len();
        let metadata = HealthMetadata::new(start.elapsed(), "memory")
            .with_detail("partition_count", partition_count.to_string());
        Ok(HealthStatus::healthy(metadata))
    }
}
