//! SQLite-backed visit store implementation.
//!
//! This module provides [`SqliteVisitStore`], which implements the
//! [`VisitStore`](visitstat_storage::VisitStore) trait on top of a single
//! `rusqlite` connection.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle, TransactionBehavior, params};
use tokio::task::spawn_blocking;
use visitstat_storage::{
    DailyStat, HealthMetadata, HealthProbe, HealthStatus, Partition, PathClientCount, PathTotal,
    StorageResult, Visit, VisitCount, VisitStore,
};

use crate::{
    config::SqliteStoreConfig,
    error::{Result, SqliteStorageError},
    schema,
};

/// Durable implementation of [`VisitStore`] on SQLite.
///
/// Each partition is stored in its own table, so the `(path, ip)` and
/// `(ip)` indexes created by [`ensure_indexes`](VisitStore::ensure_indexes)
/// are per partition, and a partition can be indexed while others are not.
///
/// # Thread Safety
///
/// `SqliteVisitStore` is `Send + Sync` and cheap to clone. All clones share
/// one connection guarded by a [`parking_lot::Mutex`]; statements run on
/// tokio's blocking pool so they never stall the async executor.
///
/// # Cancellation
///
/// Dropping an operation's future (for example when a timeout elapses)
/// interrupts its statement if it is running, or keeps it from starting if
/// it is still waiting for the connection.
///
/// # Example
///
/// ```no_run
/// use visitstat_storage::{Partition, VisitStore};
/// use visitstat_storage_sqlite::{SqliteStoreConfig, SqliteVisitStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SqliteStoreConfig::builder().path("visits.db").build()?;
///     let store = SqliteVisitStore::open(config).await?;
///
///     let count = store.count(&Partition::from("example.com"), None).await?;
///     println!("pv={} uv={}", count.pv, count.uv);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SqliteVisitStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    config: SqliteStoreConfig,
}

/// Progress of one `with_conn` call, shared with its blocking closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Owned by the awaiting side of `with_conn`. Dropped before the closure
/// finishes, it marks the call abandoned and interrupts the statement.
struct CallGuard {
    state: Arc<Mutex<CallState>>,
    interrupt: Arc<InterruptHandle>,
}

impl CallGuard {
    fn new(interrupt: Arc<InterruptHandle>) -> Self {
        Self { state: Arc::new(Mutex::new(CallState::Queued)), interrupt }
    }

    fn finish(&self) {
        *self.state.lock() = CallState::Finished;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match *state {
            CallState::Queued => *state = CallState::Abandoned,
            CallState::Running => {
                // The closure holds the connection while Running, so this
                // can only hit the abandoned statement.
                *state = CallState::Abandoned;
                self.interrupt.interrupt();
                tracing::debug!("Interrupted abandoned SQLite statement");
            },
            CallState::Finished | CallState::Abandoned => {},
        }
    }
}

impl std::fmt::Debug for SqliteVisitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVisitStore").field("config", &self.config).finish_non_exhaustive()
    }
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| SqliteStorageError::Decode(format!("negative count {value}")))
}

fn since_millis(since: Option<DateTime<Utc>>) -> i64 {
    since.map_or(i64::MIN, |t| t.timestamp_millis())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn.query_row(schema::TABLE_EXISTS, params![table], |row| row.get(0))?)
}

fn list_partitions(conn: &Connection) -> Result<Vec<Partition>> {
    let mut stmt = conn.prepare(schema::LIST_TABLES)?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().filter_map(|name| schema::partition_from_table(name)).collect())
}

impl SqliteVisitStore {
    /// Opens (or creates) the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// file cannot be opened.
    pub async fn open(config: SqliteStoreConfig) -> Result<Self> {
        config.validate()?;

        let path = config.path.clone();
        let busy_timeout = config.busy_timeout;
        let (conn, interrupt) = spawn_blocking(move || -> Result<(Connection, InterruptHandle)> {
            let conn = match path {
                Some(path) => Connection::open(path)?,
                None => Connection::open_in_memory()?,
            };
            conn.busy_timeout(busy_timeout)?;
            let interrupt = conn.get_interrupt_handle();
            Ok((conn, interrupt))
        })
        .await??;

        tracing::info!(
            path = ?config.path,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "Opened SQLite visit store"
        );

        Ok(Self { conn: Arc::new(Mutex::new(conn)), interrupt: Arc::new(interrupt), config })
    }

    /// Opens a private in-memory database with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub async fn in_memory() -> Result<Self> {
        Self::open(SqliteStoreConfig::default()).await
    }

    /// Returns the configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &SqliteStoreConfig {
        &self.config
    }

    /// Lists the secondary index names of `partition`'s table.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be read.
    pub async fn index_names(&self, partition: &Partition) -> StorageResult<Vec<String>> {
        let table = schema::table_name(partition);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(schema::LIST_INDEXES)?;
            let names =
                stmt.query_map(params![table], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    /// Runs `func` against the connection on the blocking pool.
    ///
    /// Dropping the returned future abandons the call; see the type-level
    /// cancellation notes.
    async fn with_conn<F, T>(&self, func: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let call = CallGuard::new(Arc::clone(&self.interrupt));
        let state = Arc::clone(&call.state);
        let joined = spawn_blocking(move || {
            let mut guard = conn.lock();
            {
                let mut state = state.lock();
                if *state == CallState::Abandoned {
                    return Err(SqliteStorageError::Abandoned);
                }
                *state = CallState::Running;
            }
            let result = func(&mut guard);
            *state.lock() = CallState::Finished;
            result
        })
        .await;
        call.finish();
        let result = joined.map_err(SqliteStorageError::from)?;
        result.map_err(|err| {
            tracing::debug!(error = %err, "SQLite operation failed");
            err.into()
        })
    }
}

#[async_trait]
impl VisitStore for SqliteVisitStore {
    #[tracing::instrument(skip_all, fields(partition = %visit.partition))]
    async fn insert(&self, visit: &Visit) -> StorageResult<()> {
        let table = schema::table_name(&visit.partition);
        let visit = visit.clone();
        self.with_conn(move |conn| {
            conn.execute(&schema::create_table(&table), [])?;
            conn.execute(
                &schema::insert(&table),
                params![
                    visit.visitor_id.as_str(),
                    visit.path,
                    visit.client_address,
                    visit.user_agent,
                    visit.referrer,
                    visit.occurred_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn list_partitions(&self) -> StorageResult<Vec<Partition>> {
        self.with_conn(|conn| list_partitions(conn)).await
    }

    #[tracing::instrument(skip_all, fields(partition = %partition, path = ?path))]
    async fn count(&self, partition: &Partition, path: Option<&str>) -> StorageResult<VisitCount> {
        let table = schema::table_name(partition);
        let path = path.map(str::to_owned);
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(VisitCount::default());
            }
            let quoted = schema::quote_ident(&table);
            let (pv, uv): (i64, i64) = match path {
                Some(path) => conn.query_row(
                    &format!("SELECT COUNT(*), COUNT(DISTINCT ip) FROM {quoted} WHERE path = ?1"),
                    params![path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?,
                None => conn.query_row(
                    &format!("SELECT COUNT(*), COUNT(DISTINCT ip) FROM {quoted}"),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?,
            };
            Ok(VisitCount { pv: to_u64(pv)?, uv: to_u64(uv)? })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn group_by_path_client(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<PathClientCount>> {
        let table = schema::table_name(partition);
        let since = since_millis(since);
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(Vec::new());
            }
            let sql = format!(
                "SELECT path, ip, COUNT(*) FROM {} WHERE created_at >= ?1 GROUP BY path, ip ORDER BY path, ip",
                schema::quote_ident(&table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(path, client_address, visits)| -> Result<PathClientCount> {
                    Ok(PathClientCount { path, client_address, visits: to_u64(visits)? })
                })
                .collect()
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn daily_counts(
        &self,
        partition: &Partition,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DailyStat>> {
        let table = schema::table_name(partition);
        let since = since_millis(since);
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(Vec::new());
            }
            let sql = format!(
                "SELECT date(created_at / 1000, 'unixepoch') AS day, COUNT(*), COUNT(DISTINCT ip)
                 FROM {} WHERE created_at >= ?1 GROUP BY day ORDER BY day",
                schema::quote_ident(&table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(day, pv, uv)| -> Result<DailyStat> {
                    let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                        .map_err(|e| SqliteStorageError::Decode(format!("bad day {day:?}: {e}")))?;
                    Ok(DailyStat { date, pv: to_u64(pv)?, uv: to_u64(uv)? })
                })
                .collect()
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn path_totals(&self) -> StorageResult<Vec<PathTotal>> {
        self.with_conn(|conn| {
            let mut totals = Vec::new();
            for partition in list_partitions(conn)? {
                let sql = format!(
                    "SELECT path, COUNT(*) FROM {} GROUP BY path ORDER BY path",
                    schema::quote_ident(&schema::table_name(&partition))
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (path, visits) in rows {
                    totals.push(PathTotal { partition: partition.clone(), path, visits: to_u64(visits)? });
                }
            }
            Ok(totals)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(partition = %partition, path = path, threshold = threshold))]
    async fn delete_group_below(
        &self,
        partition: &Partition,
        path: &str,
        threshold: u64,
    ) -> StorageResult<u64> {
        let table = schema::table_name(partition);
        let path = path.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: bool = tx.query_row(schema::TABLE_EXISTS, params![table], |row| row.get(0))?;
            if !exists {
                return Ok(0);
            }
            let quoted = schema::quote_ident(&table);
            let current: i64 =
                tx.query_row(&format!("SELECT COUNT(*) FROM {quoted} WHERE path = ?1"), params![path], |row| {
                    row.get(0)
                })?;
            let current = to_u64(current)?;
            if current == 0 || current >= threshold {
                return Ok(0);
            }
            let deleted = tx.execute(&format!("DELETE FROM {quoted} WHERE path = ?1"), params![path])?;
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(partition = %partition))]
    async fn ensure_indexes(&self, partition: &Partition) -> StorageResult<()> {
        let table = schema::table_name(partition);
        self.with_conn(move |conn| {
            conn.execute(&schema::create_table(&table), [])?;
            conn.execute_batch(&schema::create_indexes(&table))?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(probe = %probe))]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        let partition_count = self
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(list_partitions(conn)?.len())
            })
            .await?;
        let metadata = HealthMetadata::new(start.elapsed(), "sqlite")
            .with_detail("partition_count", partition_count.to_string())
            .with_detail("in_memory", self.config.path.is_none().to_string());
        Ok(HealthStatus::healthy(metadata))
    }
}
