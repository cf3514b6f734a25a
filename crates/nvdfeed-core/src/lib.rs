//! Core domain model for NVD feed ingest.

use std::ops::RangeInclusive;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "nvdfeed-core";

/// First year NVD publishes a yearly CVE archive for. The 2002 archive also
/// carries every entry published before 2002.
pub const FIRST_FEED_YEAR: i32 = 2002;

pub const DEFAULT_CVE_BASE_URL: &str = "https://nvd.nist.gov/feeds/json/cve/1.1";
pub const DEFAULT_CPE_MATCH_URL: &str =
    "https://nvd.nist.gov/feeds/json/cpematch/1.0/nvdcpematch-1.0.json.zip";
pub const DEFAULT_CPE_DICTIONARY_URL: &str =
    "https://nvd.nist.gov/feeds/xml/cpe/dictionary/official-cpe-dictionary_v2.3.xml.zip";

/// CVSS v3 block of a feed item (`impact.baseMetricV3`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssV3Metrics {
    pub version: Option<String>,
    pub vector_string: Option<String>,
    pub base_score: f64,
    pub base_severity: String,
    pub impact_score: Option<f64>,
    pub exploitability_score: Option<f64>,
    pub attack_vector: Option<String>,
    pub attack_complexity: Option<String>,
    pub privileges_required: Option<String>,
    pub user_interaction: Option<String>,
    pub scope: Option<String>,
    pub confidentiality_impact: Option<String>,
    pub integrity_impact: Option<String>,
    pub availability_impact: Option<String>,
}

/// CVSS v2 block of a feed item (`impact.baseMetricV2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssV2Metrics {
    pub version: Option<String>,
    pub vector_string: Option<String>,
    pub base_score: f64,
    pub severity: Option<String>,
    pub impact_score: Option<f64>,
    pub exploitability_score: Option<f64>,
    pub access_vector: Option<String>,
    pub access_complexity: Option<String>,
    pub authentication: Option<String>,
}

/// One version of a CVE as published in a feed archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    pub cve_id: String,
    pub description: String,
    pub cvss_v3: Option<CvssV3Metrics>,
    pub cvss_v2: Option<CvssV2Metrics>,
    pub published_date: NaiveDateTime,
    pub last_modified_date: NaiveDateTime,
    pub full_cve_json: JsonValue,
}

/// Entry of the CPE match feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpeMatchRecord {
    pub cpe_23_uri: String,
    /// Comma-joined `cpe23Uri` values of the entry's `cpe_name` list.
    pub cpe_name: Option<String>,
    pub full_cpe_match_json: JsonValue,
}

/// Download locations for the NVD data feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoints {
    pub cve_base_url: String,
    pub cpe_match_url: String,
    pub cpe_dictionary_url: String,
}

impl Default for FeedEndpoints {
    fn default() -> Self {
        Self {
            cve_base_url: DEFAULT_CVE_BASE_URL.to_string(),
            cpe_match_url: DEFAULT_CPE_MATCH_URL.to_string(),
            cpe_dictionary_url: DEFAULT_CPE_DICTIONARY_URL.to_string(),
        }
    }
}

/// A downloadable NVD archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedArchive {
    CveYear(i32),
    CveModified,
    CpeMatch,
    CpeDictionary,
}

impl FeedArchive {
    fn cve_feed_name(&self) -> Option<String> {
        match self {
            Self::CveYear(year) => Some(year.to_string()),
            Self::CveModified => Some("modified".to_string()),
            Self::CpeMatch | Self::CpeDictionary => None,
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::CveYear(_) | Self::CveModified => format!(
                "nvdcve-1.1-{}.json.zip",
                self.cve_feed_name().unwrap_or_default()
            ),
            Self::CpeMatch => "nvdcpematch-1.0.json.zip".to_string(),
            Self::CpeDictionary => "official-cpe-dictionary_v2.3.xml.zip".to_string(),
        }
    }

    /// Name of the single member inside the ZIP.
    pub fn member_name(&self) -> String {
        let file_name = self.file_name();
        file_name
            .strip_suffix(".zip")
            .unwrap_or(&file_name)
            .to_string()
    }

    pub fn url(&self, endpoints: &FeedEndpoints) -> String {
        match self {
            Self::CveYear(_) | Self::CveModified => format!(
                "{}/{}",
                endpoints.cve_base_url.trim_end_matches('/'),
                self.file_name()
            ),
            Self::CpeMatch => endpoints.cpe_match_url.clone(),
            Self::CpeDictionary => endpoints.cpe_dictionary_url.clone(),
        }
    }

    /// `.meta` companion URL; only CVE archives publish one.
    pub fn meta_url(&self, endpoints: &FeedEndpoints) -> Option<String> {
        self.cve_feed_name().map(|name| {
            format!(
                "{}/nvdcve-1.1-{name}.meta",
                endpoints.cve_base_url.trim_end_matches('/')
            )
        })
    }
}

/// Contents of an NVD `.meta` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMeta {
    pub last_modified: DateTime<FixedOffset>,
    pub size: u64,
    pub zip_size: u64,
    pub gz_size: u64,
    /// SHA-256 of the uncompressed JSON, as published (upper-case hex).
    pub sha256: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("unrecognized NVD timestamp {0:?}")]
    Unrecognized(String),
}

const NVD_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parses feed timestamps such as `2010-12-16T05:00Z`.
///
/// The result is offset-naive; NVD writes these values in UTC.
pub fn parse_nvd_timestamp(value: &str) -> Result<NaiveDateTime, TimestampError> {
    let trimmed = value.trim();
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    NVD_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .ok_or_else(|| TimestampError::Unrecognized(value.to_string()))
}

/// Whether an incoming CVE version should be written given the latest stored
/// `last_modified_date` for the same identifier. A missing stored record is
/// always superseded.
pub fn supersedes(incoming: NaiveDateTime, stored: Option<NaiveDateTime>) -> bool {
    match stored {
        Some(stored) => incoming > stored,
        None => true,
    }
}

/// Whether a remote feed published at `remote` should replace the local copy
/// last written at `local`.
pub fn feed_is_newer(remote: DateTime<Utc>, local: Option<DateTime<Utc>>) -> bool {
    match local {
        Some(local) => remote > local,
        None => true,
    }
}

/// Yearly archives to fetch, `first..=last`, with `last` defaulting to the
/// current year.
pub fn feed_years(first: i32, last: Option<i32>) -> RangeInclusive<i32> {
    let last = last.unwrap_or_else(|| Utc::now().year());
    first..=last
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike};

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn parses_feed_minute_precision_timestamps() {
        assert_eq!(
            parse_nvd_timestamp("2010-12-16T05:00Z").unwrap(),
            ts(2010, 12, 16, 5, 0)
        );
        assert_eq!(
            parse_nvd_timestamp("2019-07-01T23:59Z").unwrap(),
            ts(2019, 7, 1, 23, 59)
        );
    }

    #[test]
    fn parses_second_and_fractional_variants() {
        let parsed = parse_nvd_timestamp("2021-03-04T10:11:12Z").unwrap();
        assert_eq!(parsed, ts(2021, 3, 4, 10, 11) + chrono::Duration::seconds(12));
        let frac = parse_nvd_timestamp("2021-03-04T10:11:12.500").unwrap();
        assert_eq!(frac.nanosecond(), 500_000_000);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert_eq!(
            parse_nvd_timestamp("yesterday"),
            Err(TimestampError::Unrecognized("yesterday".to_string()))
        );
        assert!(parse_nvd_timestamp("2010-12-16").is_err());
    }

    #[test]
    fn missing_stored_record_is_always_superseded() {
        assert!(supersedes(ts(1999, 1, 1, 0, 0), None));
    }

    #[test]
    fn only_strictly_newer_versions_supersede() {
        let stored = ts(2020, 5, 1, 12, 0);
        assert!(supersedes(ts(2020, 5, 1, 12, 1), Some(stored)));
        assert!(!supersedes(stored, Some(stored)));
        assert!(!supersedes(ts(2019, 5, 1, 12, 0), Some(stored)));
    }

    #[test]
    fn remote_feed_newer_than_local_copy() {
        let remote = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        assert!(feed_is_newer(remote, None));
        assert!(feed_is_newer(remote, Some(remote - chrono::Duration::hours(1))));
        assert!(!feed_is_newer(remote, Some(remote)));
        assert!(!feed_is_newer(remote, Some(remote + chrono::Duration::hours(1))));
    }

    #[test]
    fn archive_names_and_urls() {
        let endpoints = FeedEndpoints::default();
        let year = FeedArchive::CveYear(2002);
        assert_eq!(year.file_name(), "nvdcve-1.1-2002.json.zip");
        assert_eq!(year.member_name(), "nvdcve-1.1-2002.json");
        assert_eq!(
            year.url(&endpoints),
            "https://nvd.nist.gov/feeds/json/cve/1.1/nvdcve-1.1-2002.json.zip"
        );
        assert_eq!(
            FeedArchive::CveModified.meta_url(&endpoints).as_deref(),
            Some("https://nvd.nist.gov/feeds/json/cve/1.1/nvdcve-1.1-modified.meta")
        );
        assert_eq!(FeedArchive::CpeMatch.member_name(), "nvdcpematch-1.0.json");
        assert_eq!(FeedArchive::CpeMatch.url(&endpoints), DEFAULT_CPE_MATCH_URL);
        assert!(FeedArchive::CpeDictionary.meta_url(&endpoints).is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let endpoints = FeedEndpoints {
            cve_base_url: "http://mirror.local/cve/".to_string(),
            ..FeedEndpoints::default()
        };
        assert_eq!(
            FeedArchive::CveModified.url(&endpoints),
            "http://mirror.local/cve/nvdcve-1.1-modified.json.zip"
        );
    }

    #[test]
    fn feed_years_are_inclusive() {
        let years: Vec<_> = feed_years(FIRST_FEED_YEAR, Some(2004)).collect();
        assert_eq!(years, vec![2002, 2003, 2004]);
        assert!(feed_years(FIRST_FEED_YEAR, None).contains(&Utc::now().year()));
    }
}
