//! Health check types for visit stores.
//!
//! [`VisitStore::health_check`](crate::VisitStore::health_check) returns a
//! [`HealthStatus`] rather than a bare boolean so callers can tell a
//! backend that is reachable but slow apart from one that is down.
//!
//! The engine's startup connectivity wait polls with
//! [`HealthProbe::Startup`] and treats anything other than an unhealthy
//! status as "reachable".

use std::{collections::BTreeMap, fmt, time::Duration};

/// The kind of health probe to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthProbe {
    /// Process is alive and the store is not deadlocked.
    Liveness,
    /// The store can serve reads and writes.
    Readiness,
    /// The first connection has been established.
    Startup,
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Liveness => write!(f, "liveness"),
            Self::Readiness => write!(f, "readiness"),
            Self::Startup => write!(f, "startup"),
        }
    }
}

/// Result of a health probe.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy(HealthMetadata),
    /// Operational with reduced capability; the string says why.
    Degraded(HealthMetadata, String),
    /// Cannot serve traffic; the string says why.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status with a reason.
    #[must_use]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` if the store is fully healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if the store can serve traffic, possibly degraded.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unhealthy(..))
    }

    /// Returns the metadata attached to this status.
    #[must_use]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }

    /// Returns the degradation or failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unhealthy(_, reason) => Some(reason),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy(m) => write!(f, "healthy ({}ms)", m.check_duration.as_millis()),
            Self::Degraded(m, reason) => {
                write!(f, "degraded: {} ({}ms)", reason, m.check_duration.as_millis())
            },
            Self::Unhealthy(m, reason) => {
                write!(f, "unhealthy: {} ({}ms)", reason, m.check_duration.as_millis())
            },
        }
    }
}

/// Timing and backend details for a health probe.
#[derive(Debug, Clone)]
pub struct HealthMetadata {
    /// How long the probe took.
    pub check_duration: Duration,
    /// Backend identifier, e.g. `"memory"` or `"sqlite"`.
    pub backend: String,
    /// Backend-specific details such as `partition_count`.
    pub details: BTreeMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata for the given probe duration and backend name.
    #[must_use]
    pub fn new(check_duration: Duration, backend: impl Into<String>) -> Self {
        Self { check_duration, backend: backend.into(), details: BTreeMap::new() }
    }

    /// Adds a detail entry, returning `self` for chaining.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
