//! Ingestion response and request parameter parsing.

use serde::{Deserialize, Serialize};

/// Window used by dashboards when the request does not name one.
pub const DEFAULT_DAYS: u32 = 30;

/// Largest accepted dashboard window, in days.
pub const MAX_DAYS: u32 = 365;

/// Which counts to return after recording a visit.
///
/// Page counts are always reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSelection {
    /// Also report partition-wide counts.
    pub site: bool,
}

impl ReportSelection {
    /// Page counts only.
    pub const PAGE: Self = Self { site: false };

    /// Page and site counts.
    pub const PAGE_AND_SITE: Self = Self { site: true };

    /// Parses a space- or plus-separated list of `page` and `site`.
    ///
    /// Unknown tokens are ignored.
    ///
    /// ```
    /// use visitstat_engine::ReportSelection;
    ///
    /// assert!(ReportSelection::parse(Some("page+site")).site);
    /// assert!(!ReportSelection::parse(Some("page")).site);
    /// assert!(!ReportSelection::parse(None).site);
    /// ```
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let site = raw
            .unwrap_or_default()
            .split([' ', '+'])
            .any(|token| token.trim().eq_ignore_ascii_case("site"));
        Self { site }
    }
}

/// Counts returned to the client after a visit is recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatReport {
    /// Page views of the visited path.
    pub page_pv: u64,
    /// Unique visitors of the visited path.
    pub page_uv: u64,
    /// Page views of the whole partition, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_pv: Option<u64>,
    /// Unique visitors of the whole partition, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_uv: Option<u64>,
}

/// Parses the `days` dashboard parameter.
///
/// Missing, unparsable, zero, negative and over-[`MAX_DAYS`] values fall
/// back to [`DEFAULT_DAYS`]. The whole trimmed value must be an integer, so
/// `"7abc"` falls back too rather than reading the leading `7`.
#[must_use]
pub fn parse_days(raw: Option<&str>) -> u32 {
    raw.and_then(|d| d.trim().parse::<i64>().ok())
        .and_then(|d| u32::try_from(d).ok())
        .filter(|d| (1..=MAX_DAYS).contains(d))
        .unwrap_or(DEFAULT_DAYS)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::absent(None, false)]
    #[case::page(Some("page"), false)]
    #[case::plus(Some("page+site"), true)]
    #[case::space(Some("page site"), true)]
    #[case::site_only(Some("site"), true)]
    #[case::unknown_ignored(Some("page+bogus"), false)]
    #[case::mixed_case(Some("Page+SITE"), true)]
    fn test_report_selection(#[case] raw: Option<&str>, #[case] site: bool) {
        assert_eq!(ReportSelection::parse(raw).site, site);
    }

    #[rstest]
    #[case::absent(None, 30)]
    #[case::valid(Some("7"), 7)]
    #[case::max(Some("365"), 365)]
    #[case::too_large(Some("366"), 30)]
    #[case::zero(Some("0"), 30)]
    #[case::negative(Some("-5"), 30)]
    #[case::garbage(Some("week"), 30)]
    #[case::padded(Some(" 14 "), 14)]
    #[case::trailing_text(Some("7abc"), 30)]
    fn test_parse_days(#[case] raw: Option<&str>, #[case] expected: u32) {
        assert_eq!(parse_days(raw), expected);
    }

    #[test]
    fn test_page_only_report_omits_site_fields() {
        let report = StatReport { page_pv: 3, page_uv: 2, ..StatReport::default() };
        let json = serde_json::to_value(report).expect("serialize");
        assert_eq!(json, serde_json::json!({"page_pv": 3, "page_uv": 2}));
    }

    #[test]
    fn test_site_report_includes_site_fields() {
        let report = StatReport { page_pv: 3, page_uv: 2, site_pv: Some(10), site_uv: Some(4) };
        let json = serde_json::to_value(report).expect("serialize");
        assert_eq!(json["site_pv"], 10);
        assert_eq!(json["site_uv"], 4);
    }
}
