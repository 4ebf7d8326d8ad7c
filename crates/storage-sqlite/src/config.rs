//! Configuration for the SQLite visit store.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use visitstat_storage::ConfigError;

/// Default time SQLite waits on a locked database before failing (5 seconds).
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`SqliteVisitStore`](crate::SqliteVisitStore).
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use visitstat_storage_sqlite::SqliteStoreConfig;
///
/// let config = SqliteStoreConfig::builder()
///     .path("/var/lib/visitstat/visits.db")
///     .busy_timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    /// Database file. `None` opens a private in-memory database.
    #[serde(default)]
    pub(crate) path: Option<PathBuf>,

    /// How long a statement waits on a locked database.
    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    pub(crate) busy_timeout: Duration,
}

fn default_busy_timeout() -> Duration {
    DEFAULT_BUSY_TIMEOUT
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self { path: None, busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

#[bon::bon]
impl SqliteStoreConfig {
    /// Creates a new configuration.
    ///
    /// # Optional Fields
    ///
    /// * `path` - Database file (default: in-memory).
    /// * `busy_timeout` - Lock wait (default: 5 seconds).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `busy_timeout` is zero.
    #[builder]
    pub fn new(
        #[builder(into)] path: Option<PathBuf>,
        #[builder(default = DEFAULT_BUSY_TIMEOUT)] busy_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { path, busy_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges, for configurations obtained through serde.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `busy_timeout` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.busy_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "busy_timeout",
                value: format!("{:?}", self.busy_timeout),
            });
        }
        Ok(())
    }

    /// Returns the database file, or `None` for an in-memory database.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Returns the lock wait.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }
}
