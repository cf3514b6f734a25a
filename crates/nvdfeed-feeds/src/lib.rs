//! NVD JSON 1.1 feed parsing: ZIP member extraction, CVE items, CPE matches
//! and `.meta` descriptors.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use chrono::DateTime;
use nvdfeed_core::{
    parse_nvd_timestamp, CpeMatchRecord, CveRecord, CvssV2Metrics, CvssV3Metrics, FeedMeta,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

pub const CRATE_NAME: &str = "nvdfeed-feeds";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading zip archive: {0}")]
    Zip(#[from] ZipError),
    #[error("reading archive member {name}: {source}")]
    Member {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive contains no files")]
    EmptyArchive,
    #[error("parsing feed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feed document has no {0} array")]
    MissingArray(&'static str),
    #[error("meta file is missing {0}")]
    MissingMetaField(&'static str),
    #[error("meta field {field} has invalid value {value:?}")]
    InvalidMetaField { field: &'static str, value: String },
}

/// Feed entry that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedItem {
    pub index: usize,
    pub identifier: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CveFeed {
    pub data_timestamp: Option<String>,
    pub records: Vec<CveRecord>,
    pub rejected: Vec<RejectedItem>,
}

#[derive(Debug, Clone)]
pub struct CpeMatchFeed {
    pub records: Vec<CpeMatchRecord>,
    pub rejected: Vec<RejectedItem>,
}

/// Returns the bytes of `preferred`, or of the first file member when the
/// archive does not carry that name.
pub fn extract_feed_member(zip_bytes: &[u8], preferred: Option<&str>) -> Result<Vec<u8>, FeedError> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

    if let Some(name) = preferred {
        match archive.by_name(name) {
            Ok(mut file) => return read_member(&mut file, name.to_string()),
            Err(ZipError::FileNotFound) => {
                debug!(member = name, "member not found; using first file in archive");
            }
            Err(err) => return Err(err.into()),
        }
    }

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_file() {
            let name = file.name().to_string();
            return read_member(&mut file, name);
        }
    }

    Err(FeedError::EmptyArchive)
}

fn read_member(file: &mut impl Read, name: String) -> Result<Vec<u8>, FeedError> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|source| FeedError::Member { name, source })?;
    Ok(buf)
}

#[derive(Debug, Deserialize)]
struct CveFeedDocument {
    #[serde(rename = "CVE_data_timestamp")]
    data_timestamp: Option<String>,
    #[serde(rename = "CVE_Items")]
    items: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CveItem {
    cve: CveSection,
    impact: Option<ImpactSection>,
    published_date: String,
    last_modified_date: String,
}

#[derive(Debug, Deserialize)]
struct CveSection {
    #[serde(rename = "CVE_data_meta")]
    data_meta: CveDataMeta,
    #[serde(default)]
    description: DescriptionSection,
}

#[derive(Debug, Deserialize)]
struct CveDataMeta {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DescriptionSection {
    #[serde(default)]
    description_data: Vec<LangString>,
}

#[derive(Debug, Deserialize)]
struct LangString {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpactSection {
    base_metric_v3: Option<BaseMetricV3>,
    base_metric_v2: Option<BaseMetricV2>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseMetricV3 {
    cvss_v3: CvssV3Data,
    exploitability_score: Option<f64>,
    impact_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssV3Data {
    version: Option<String>,
    vector_string: Option<String>,
    attack_vector: Option<String>,
    attack_complexity: Option<String>,
    privileges_required: Option<String>,
    user_interaction: Option<String>,
    scope: Option<String>,
    confidentiality_impact: Option<String>,
    integrity_impact: Option<String>,
    availability_impact: Option<String>,
    base_score: f64,
    base_severity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseMetricV2 {
    cvss_v2: CvssV2Data,
    severity: Option<String>,
    exploitability_score: Option<f64>,
    impact_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssV2Data {
    version: Option<String>,
    vector_string: Option<String>,
    access_vector: Option<String>,
    access_complexity: Option<String>,
    authentication: Option<String>,
    base_score: f64,
}

impl From<BaseMetricV3> for CvssV3Metrics {
    fn from(metric: BaseMetricV3) -> Self {
        let cvss = metric.cvss_v3;
        Self {
            version: cvss.version,
            vector_string: cvss.vector_string,
            base_score: cvss.base_score,
            base_severity: cvss.base_severity,
            impact_score: metric.impact_score,
            exploitability_score: metric.exploitability_score,
            attack_vector: cvss.attack_vector,
            attack_complexity: cvss.attack_complexity,
            privileges_required: cvss.privileges_required,
            user_interaction: cvss.user_interaction,
            scope: cvss.scope,
            confidentiality_impact: cvss.confidentiality_impact,
            integrity_impact: cvss.integrity_impact,
            availability_impact: cvss.availability_impact,
        }
    }
}

impl From<BaseMetricV2> for CvssV2Metrics {
    fn from(metric: BaseMetricV2) -> Self {
        let cvss = metric.cvss_v2;
        Self {
            version: cvss.version,
            vector_string: cvss.vector_string,
            base_score: cvss.base_score,
            severity: metric.severity,
            impact_score: metric.impact_score,
            exploitability_score: metric.exploitability_score,
            access_vector: cvss.access_vector,
            access_complexity: cvss.access_complexity,
            authentication: cvss.authentication,
        }
    }
}

fn json_str<'a>(value: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(JsonValue::as_str)
}

fn cve_record_from_item(item: JsonValue) -> Result<CveRecord, String> {
    let parsed = CveItem::deserialize(&item).map_err(|err| err.to_string())?;
    let published_date =
        parse_nvd_timestamp(&parsed.published_date).map_err(|err| format!("publishedDate: {err}"))?;
    let last_modified_date = parse_nvd_timestamp(&parsed.last_modified_date)
        .map_err(|err| format!("lastModifiedDate: {err}"))?;
    let impact = parsed.impact.unwrap_or_default();
    let description = parsed
        .cve
        .description
        .description_data
        .into_iter()
        .next()
        .map(|d| d.value)
        .unwrap_or_default();

    Ok(CveRecord {
        cve_id: parsed.cve.data_meta.id,
        description,
        cvss_v3: impact.base_metric_v3.map(Into::into),
        cvss_v2: impact.base_metric_v2.map(Into::into),
        published_date,
        last_modified_date,
        full_cve_json: item,
    })
}

/// Parses a `nvdcve-1.1-*.json` document. Items that do not fit the schema
/// are reported in [`CveFeed::rejected`] instead of failing the document.
pub fn parse_cve_feed(json: &[u8]) -> Result<CveFeed, FeedError> {
    let document: CveFeedDocument = serde_json::from_slice(json)?;
    let items = document.items.ok_or(FeedError::MissingArray("CVE_Items"))?;

    let mut records = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let identifier = json_str(&item, "/cve/CVE_data_meta/ID").map(ToString::to_string);
        match cve_record_from_item(item) {
            Ok(record) => records.push(record),
            Err(reason) => rejected.push(RejectedItem {
                index,
                identifier,
                reason,
            }),
        }
    }

    Ok(CveFeed {
        data_timestamp: document.data_timestamp,
        records,
        rejected,
    })
}

#[derive(Debug, Deserialize)]
struct CpeMatchDocument {
    matches: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct CpeMatchItem {
    #[serde(rename = "cpe23Uri")]
    cpe23_uri: String,
    #[serde(default)]
    cpe_name: Vec<CpeName>,
}

#[derive(Debug, Deserialize)]
struct CpeName {
    #[serde(rename = "cpe23Uri")]
    cpe23_uri: String,
}

/// Parses `nvdcpematch-1.0.json`.
pub fn parse_cpe_match_feed(json: &[u8]) -> Result<CpeMatchFeed, FeedError> {
    let document: CpeMatchDocument = serde_json::from_slice(json)?;
    let items = document.matches.ok_or(FeedError::MissingArray("matches"))?;

    let mut records = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match CpeMatchItem::deserialize(&item) {
            Ok(parsed) => {
                let cpe_name = if parsed.cpe_name.is_empty() {
                    None
                } else {
                    Some(
                        parsed
                            .cpe_name
                            .iter()
                            .map(|n| n.cpe23_uri.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                    )
                };
                records.push(CpeMatchRecord {
                    cpe_23_uri: parsed.cpe23_uri,
                    cpe_name,
                    full_cpe_match_json: item,
                });
            }
            Err(err) => rejected.push(RejectedItem {
                index,
                identifier: json_str(&item, "/cpe23Uri").map(ToString::to_string),
                reason: err.to_string(),
            }),
        }
    }

    Ok(CpeMatchFeed { records, rejected })
}

/// Parses an NVD `.meta` descriptor:
///
/// ```text
/// lastModifiedDate:2020-07-23T03:01:20-04:00
/// size:12345
/// zipSize:1234
/// gzSize:1200
/// sha256:ABCDEF...
/// ```
pub fn parse_feed_meta(text: &str) -> Result<FeedMeta, FeedError> {
    let fields: HashMap<&str, &str> = text
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();

    let get = |field: &'static str| {
        fields
            .get(field)
            .copied()
            .filter(|v| !v.is_empty())
            .ok_or(FeedError::MissingMetaField(field))
    };
    let number = |field: &'static str| -> Result<u64, FeedError> {
        let raw = get(field)?;
        raw.parse().map_err(|_| FeedError::InvalidMetaField {
            field,
            value: raw.to_string(),
        })
    };

    let raw_modified = get("lastModifiedDate")?;
    let last_modified =
        DateTime::parse_from_rfc3339(raw_modified).map_err(|_| FeedError::InvalidMetaField {
            field: "lastModifiedDate",
            value: raw_modified.to_string(),
        })?;

    Ok(FeedMeta {
        last_modified,
        size: number("size")?,
        zip_size: number("zipSize")?,
        gz_size: number("gzSize")?,
        sha256: get("sha256")?.to_string(),
    })
}
