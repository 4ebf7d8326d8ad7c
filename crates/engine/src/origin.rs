//! Origin allow listing for ingestion.
//!
//! Every declared URL is reduced to `scheme://host[:port]` and checked
//! against an [`OriginPolicy`] before anything is stored. [`AllowList`] is
//! the stock policy: an entry matches when it occurs anywhere in the
//! origin, so `https://example.com` also admits
//! `https://example.com:8443`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Origins admitted in addition to the configured list outside production.
pub const DEVELOPMENT_ORIGINS: [&str; 2] = ["http://localhost", "http://0.0.0.0"];

/// Decides which origins may record visits.
pub trait OriginPolicy: Send + Sync + fmt::Debug {
    /// Returns `true` if `origin` (`scheme://host[:port]`) is admitted.
    fn is_allowed(&self, origin: &str) -> bool;
}

/// Substring-matching allow list.
///
/// Deserializes from the same shape as the configuration file:
///
/// ```
/// use visitstat_engine::{AllowList, OriginPolicy};
///
/// let list: AllowList = serde_json::from_str(
///     r#"{"production": false, "domain": ["https://blog.example.com"]}"#,
/// )?;
/// assert!(list.is_allowed("https://blog.example.com"));
/// assert!(list.is_allowed("http://localhost:1313"));
/// assert!(!list.is_allowed("https://evil.example.org"));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AllowListFile", into = "AllowListFile")]
pub struct AllowList {
    production: bool,
    domains: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllowListFile {
    #[serde(default)]
    production: bool,
    #[serde(default, rename = "domain")]
    domains: Vec<String>,
}

impl From<AllowListFile> for AllowList {
    fn from(file: AllowListFile) -> Self {
        Self::new(file.production, file.domains)
    }
}

impl From<AllowList> for AllowListFile {
    fn from(list: AllowList) -> Self {
        let domains = if list.production {
            list.domains
        } else {
            list.domains.into_iter().filter(|d| !DEVELOPMENT_ORIGINS.contains(&d.as_str())).collect()
        };
        Self { production: list.production, domains }
    }
}

impl AllowList {
    /// Creates an allow list. Outside production the
    /// [`DEVELOPMENT_ORIGINS`] are appended.
    pub fn new<I, D>(production: bool, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let mut domains: Vec<String> = domains.into_iter().map(Into::into).collect();
        if !production {
            for origin in DEVELOPMENT_ORIGINS {
                if !domains.iter().any(|d| d == origin) {
                    domains.push(origin.to_owned());
                }
            }
        }
        Self { production, domains }
    }

    /// Returns `true` when development origins are not admitted.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.production
    }

    /// Returns every entry, development origins included.
    #[must_use]
    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

impl OriginPolicy for AllowList {
    fn is_allowed(&self, origin: &str) -> bool {
        // An empty entry would match everything.
        self.domains.iter().any(|d| !d.is_empty() && origin.contains(d.as_str()))
    }
}
