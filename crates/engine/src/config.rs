//! Engine configuration.
//!
//! [`EngineConfig`] groups the time limits, retry budgets and fan-out
//! settings of every engine component. Each section can be built in code
//! with a validated `bon` builder or deserialized with serde, where
//! durations use humantime syntax (`"10s"`, `"5m"`).
//!
//! ```
//! use std::time::Duration;
//! use visitstat_engine::config::{EngineConfig, ReadinessConfig};
//!
//! let config = EngineConfig::builder()
//!     .readiness(ReadinessConfig::builder().max_attempts(5).build()?)
//!     .count_timeout(Duration::from_secs(3))
//!     .build()?;
//! assert_eq!(config.readiness.max_attempts, 5);
//! # Ok::<(), visitstat_storage::ConfigError>(())
//! ```

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use visitstat_storage::ConfigError;

const DEFAULT_INSERT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_COUNT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_READINESS_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_READINESS_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_READINESS_DEADLINE: Duration = Duration::from_secs(5 * 60);

const DEFAULT_CONNECTIVITY_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CONNECTIVITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECTIVITY_MAX_ATTEMPTS: u32 = 10;

const DEFAULT_AGGREGATION_DEADLINE: Duration = Duration::from_secs(60);

const DEFAULT_CLEANUP_THRESHOLD: u64 = 10;
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
    }
    Ok(())
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::MustBePositive { field, value: "0s".into() });
    }
    Ok(())
}

/// Number of partitions aggregated at once when not configured.
#[must_use]
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

// ── Readiness ───────────────────────────────────────────────────────────

/// Retry budget of the per-partition index ensure procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Calls to `ensure_indexes` before giving up.
    #[serde(default = "default_readiness_max_attempts")]
    pub max_attempts: u32,

    /// Attempt `n` is followed by a wait of `n × base_delay`.
    #[serde(with = "humantime_serde", default = "default_readiness_base_delay")]
    pub base_delay: Duration,

    /// Overall limit for one ensure procedure, including waits.
    #[serde(with = "humantime_serde", default = "default_readiness_deadline")]
    pub deadline: Duration,
}

fn default_readiness_max_attempts() -> u32 {
    DEFAULT_READINESS_MAX_ATTEMPTS
}

fn default_readiness_base_delay() -> Duration {
    DEFAULT_READINESS_BASE_DELAY
}

fn default_readiness_deadline() -> Duration {
    DEFAULT_READINESS_DEADLINE
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_READINESS_MAX_ATTEMPTS,
            base_delay: DEFAULT_READINESS_BASE_DELAY,
            deadline: DEFAULT_READINESS_DEADLINE,
        }
    }
}

#[bon::bon]
impl ReadinessConfig {
    /// Creates a validated readiness configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts` is zero or either
    /// duration is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_READINESS_MAX_ATTEMPTS)] max_attempts: u32,
        #[builder(default = DEFAULT_READINESS_BASE_DELAY)] base_delay: Duration,
        #[builder(default = DEFAULT_READINESS_DEADLINE)] deadline: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_attempts, base_delay, deadline };
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least_one("readiness.max_attempts", u64::from(self.max_attempts))?;
        positive("readiness.base_delay", self.base_delay)?;
        positive("readiness.deadline", self.deadline)
    }

    /// Wait after the given 1-based failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

// ── Connectivity ────────────────────────────────────────────────────────

/// Startup wait for the storage backend to become reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectivityConfig {
    /// Wait between failed probes.
    #[serde(with = "humantime_serde", default = "default_connectivity_interval")]
    pub interval: Duration,

    /// Limit for a single health probe.
    #[serde(with = "humantime_serde", default = "default_connectivity_probe_timeout")]
    pub probe_timeout: Duration,

    /// Probes before startup is declared failed.
    #[serde(default = "default_connectivity_max_attempts")]
    pub max_attempts: u32,
}

fn default_connectivity_interval() -> Duration {
    DEFAULT_CONNECTIVITY_INTERVAL
}

fn default_connectivity_probe_timeout() -> Duration {
    DEFAULT_CONNECTIVITY_PROBE_TIMEOUT
}

fn default_connectivity_max_attempts() -> u32 {
    DEFAULT_CONNECTIVITY_MAX_ATTEMPTS
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CONNECTIVITY_INTERVAL,
            probe_timeout: DEFAULT_CONNECTIVITY_PROBE_TIMEOUT,
            max_attempts: DEFAULT_CONNECTIVITY_MAX_ATTEMPTS,
        }
    }
}

#[bon::bon]
impl ConnectivityConfig {
    /// Creates a validated connectivity configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts` is zero or either
    /// duration is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CONNECTIVITY_INTERVAL)] interval: Duration,
        #[builder(default = DEFAULT_CONNECTIVITY_PROBE_TIMEOUT)] probe_timeout: Duration,
        #[builder(default = DEFAULT_CONNECTIVITY_MAX_ATTEMPTS)] max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { interval, probe_timeout, max_attempts };
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("connectivity.interval", self.interval)?;
        positive("connectivity.probe_timeout", self.probe_timeout)?;
        at_least_one("connectivity.max_attempts", u64::from(self.max_attempts))
    }
}

// ── Aggregation ─────────────────────────────────────────────────────────

/// What a dashboard aggregation does when one partition's query fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure, leave the partition out and keep going.
    #[default]
    SkipPartition,
    /// Fail the whole aggregation with the first error.
    Abort,
}

/// Bounded fan-out settings for dashboard aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    /// Shared limit for one `summarize` call.
    #[serde(with = "humantime_serde", default = "default_aggregation_deadline")]
    pub deadline: Duration,

    /// Partitions queried at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Behavior on a failed partition.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_aggregation_deadline() -> Duration {
    DEFAULT_AGGREGATION_DEADLINE
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_AGGREGATION_DEADLINE,
            concurrency: default_concurrency(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[bon::bon]
impl AggregationConfig {
    /// Creates a validated aggregation configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `deadline` or `concurrency` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_AGGREGATION_DEADLINE)] deadline: Duration,
        #[builder(default = default_concurrency())] concurrency: usize,
        #[builder(default)] failure_policy: FailurePolicy,
    ) -> Result<Self, ConfigError> {
        let config = Self { deadline, concurrency, failure_policy };
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("aggregation.deadline", self.deadline)?;
        at_least_one("aggregation.concurrency", self.concurrency as u64)
    }
}

// ── Cleanup ─────────────────────────────────────────────────────────────

/// Low-signal cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    /// Groups with fewer visits than this are deleted.
    #[serde(default = "default_cleanup_threshold")]
    pub threshold: u64,

    /// Limit for one cleanup pass.
    #[serde(with = "humantime_serde", default = "default_cleanup_timeout")]
    pub timeout: Duration,
}

fn default_cleanup_threshold() -> u64 {
    DEFAULT_CLEANUP_THRESHOLD
}

fn default_cleanup_timeout() -> Duration {
    DEFAULT_CLEANUP_TIMEOUT
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { threshold: DEFAULT_CLEANUP_THRESHOLD, timeout: DEFAULT_CLEANUP_TIMEOUT }
    }
}

#[bon::bon]
impl CleanupConfig {
    /// Creates a validated cleanup configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `threshold` or `timeout` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CLEANUP_THRESHOLD)] threshold: u64,
        #[builder(default = DEFAULT_CLEANUP_TIMEOUT)] timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { threshold, timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least_one("cleanup.threshold", self.threshold)?;
        positive("cleanup.timeout", self.timeout)
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

/// Configuration of the whole engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Limit for persisting one visit.
    #[serde(with = "humantime_serde", default = "default_insert_timeout")]
    pub insert_timeout: Duration,

    /// Limit for one PV/UV count.
    #[serde(with = "humantime_serde", default = "default_count_timeout")]
    pub count_timeout: Duration,

    /// Index ensure procedure.
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Startup connectivity wait.
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Dashboard aggregation.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Low-signal cleanup.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_insert_timeout() -> Duration {
    DEFAULT_INSERT_TIMEOUT
}

fn default_count_timeout() -> Duration {
    DEFAULT_COUNT_TIMEOUT
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            insert_timeout: DEFAULT_INSERT_TIMEOUT,
            count_timeout: DEFAULT_COUNT_TIMEOUT,
            readiness: ReadinessConfig::default(),
            connectivity: ConnectivityConfig::default(),
            aggregation: AggregationConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

#[bon::bon]
impl EngineConfig {
    /// Creates a validated engine configuration.
    ///
    /// Sections left out use their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_INSERT_TIMEOUT)] insert_timeout: Duration,
        #[builder(default = DEFAULT_COUNT_TIMEOUT)] count_timeout: Duration,
        #[builder(default)] readiness: ReadinessConfig,
        #[builder(default)] connectivity: ConnectivityConfig,
        #[builder(default)] aggregation: AggregationConfig,
        #[builder(default)] cleanup: CleanupConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { insert_timeout, count_timeout, readiness, connectivity, aggregation, cleanup };
        config.validate()?;
        Ok(config)
    }

    /// Checks every section, for configurations obtained through serde.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("insert_timeout", self.insert_timeout)?;
        positive("count_timeout", self.count_timeout)?;
        self.readiness.validate()?;
        self.connectivity.validate()?;
        self.aggregation.validate()?;
        self.cleanup.validate()
    }
}
