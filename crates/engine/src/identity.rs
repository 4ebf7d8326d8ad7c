//! Visitor identity resolution.

use uuid::Uuid;
use visitstat_storage::VisitorId;

/// Identity attached to a visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Token stored with the visit.
    pub visitor_id: VisitorId,
    /// `true` when the token was generated here and the client should
    /// store it.
    pub is_new: bool,
}

/// Resolves the client's visitor token.
///
/// A non-empty token (after trimming whitespace) is reused verbatim.
/// Anything else yields a fresh UUID v4. Tokens are not checked for
/// uniqueness against storage.
#[must_use]
pub fn resolve(token: Option<&str>) -> ResolvedIdentity {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(existing) => ResolvedIdentity { visitor_id: VisitorId::from(existing), is_new: false },
        None => ResolvedIdentity { visitor_id: VisitorId::new(Uuid::new_v4().to_string()), is_new: true },
    }
}
