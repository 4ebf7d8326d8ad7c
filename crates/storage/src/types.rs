//! Data model shared by visit stores and their consumers.
//!
//! A [`Visit`] is the only persisted entity. Everything else in this module
//! is either an identifier newtype or a derived, never-stored aggregate
//! returned by [`VisitStore`](crate::VisitStore) queries.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Macro to define a newtype wrapper around `String` with standard trait
/// implementations.
///
/// Each generated type:
/// - Derives `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Serializes transparently as the inner string
/// - Implements `From<String>`, `From<&str>`, `AsRef<str>` and `Display`
macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the inner string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the wrapper and returns the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_name!(
    /// Tenant namespace identified by hostname (including a port, if any).
    ///
    /// Partitions are created implicitly by the first visit recorded for a
    /// hostname and are never deleted.
    ///
    /// # Examples
    ///
    /// ```
    /// use visitstat_storage::Partition;
    ///
    /// let p = Partition::from("blog.example.com");
    /// assert_eq!(p.as_str(), "blog.example.com");
    /// ```
    Partition
);

define_name!(
    /// Opaque, UUID-shaped token correlating visits from the same client.
    ///
    /// It only ever exists as the `visitor_id` field of stored visits.
    VisitorId
);

/// One recorded page view.
///
/// `occurred_at` is assigned by the server at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    /// Hostname the visit was recorded for.
    pub partition: Partition,
    /// Stable visitor identity.
    pub visitor_id: VisitorId,
    /// Site-relative location.
    pub path: String,
    /// Network address of the client.
    pub client_address: String,
    /// User agent, possibly empty.
    pub user_agent: String,
    /// Referrer, possibly empty.
    pub referrer: String,
    /// Server-side ingestion time.
    pub occurred_at: DateTime<Utc>,
}

/// Page views and unique visitors for a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCount {
    /// Number of visits.
    pub pv: u64,
    /// Number of distinct client addresses among those visits.
    pub uv: u64,
}

/// Visits grouped by `(path, client_address)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathClientCount {
    /// Site-relative location.
    pub path: String,
    /// Client address.
    pub client_address: String,
    /// Number of visits in the group.
    pub visits: u64,
}

/// Total visits for one `(partition, path)` group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathTotal {
    /// Owning partition.
    pub partition: Partition,
    /// Site-relative location.
    pub path: String,
    /// Number of visits in the group.
    pub visits: u64,
}

/// PV/UV for one UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    /// The UTC day.
    pub date: NaiveDate,
    /// Page views on that day.
    pub pv: u64,
    /// Distinct client addresses on that day.
    pub uv: u64,
}

/// Ranked dashboard row for one path.
///
/// Derived, never stored. `uv <= pv` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRow {
    /// Site-relative location.
    pub path: String,
    /// Page views.
    pub pv: u64,
    /// Unique visitors.
    pub uv: u64,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display_and_conversions() {
        let p = Partition::from("example.com:8080".to_owned());
        assert_eq!(p.to_string(), "example.com:8080");
        assert_eq!(p.as_ref(), "example.com:8080");
        assert_eq!(p.clone().into_inner(), "example.com:8080");
    }

    #[test]
    fn test_partition_ordering_is_lexicographic() {
        let mut parts = vec![Partition::from("b.com"), Partition::from("a.com")];
        parts.sort();
        assert_eq!(parts, vec![Partition::from("a.com"), Partition::from("b.com")]);
    }

    #[test]
    fn test_visitor_id_serializes_transparently() {
        let id = VisitorId::new("5b1f6c1e-2a57-4c47-9d0c-6b8b7d0f1e11");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"5b1f6c1e-2a57-4c47-9d0c-6b8b7d0f1e11\"");
    }
}
