//! CVSS v3 report export: Markdown summary plus Parquet snapshots with a
//! checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::stats::{breakdown_years, monthly_cvss_v3_breakdown, MonthlyCvssV3};
use crate::store::CveStore;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CvssV3Report {
    pub out_dir: PathBuf,
    pub months: Vec<MonthlyCvssV3>,
    pub markdown_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Writes the monthly breakdown of the store's latest CVSS v3 scores into
/// `out_dir`.
pub async fn export_cvss_v3_report(store: &dyn CveStore, out_dir: &Path) -> Result<CvssV3Report> {
    let observations = store
        .cvss_v3_observations()
        .await
        .context("loading CVSS v3 observations")?;
    let months = monthly_cvss_v3_breakdown(&observations);

    let snapshot_dir = out_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let markdown_path = out_dir.join("monthly_breakdown.md");
    fs::write(&markdown_path, render_breakdown_markdown(&months))
        .await
        .with_context(|| format!("writing {}", markdown_path.display()))?;

    let monthly_path = snapshot_dir.join("cvss_v3_monthly.parquet");
    let categories_path = snapshot_dir.join("cvss_v3_categories.parquet");
    write_monthly_parquet(&monthly_path, &months)?;
    write_categories_parquet(&categories_path, &months)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("monthly_breakdown", out_dir, &markdown_path)?,
            manifest_entry("cvss_v3_monthly", out_dir, &monthly_path)?,
            manifest_entry("cvss_v3_categories", out_dir, &categories_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        months = months.len(),
        cves = observations.len(),
        out_dir = %out_dir.display(),
        "exported CVSS v3 report"
    );
    Ok(CvssV3Report {
        out_dir: out_dir.to_path_buf(),
        months,
        markdown_path,
        manifest_path,
    })
}

pub fn render_breakdown_markdown(months: &[MonthlyCvssV3]) -> String {
    let mut lines = vec!["# CVSS v3 Monthly Breakdown".to_string(), String::new()];
    if months.is_empty() {
        lines.push("No CVEs with CVSS v3 metrics are stored yet.".to_string());
        lines.push(String::new());
        return lines.join("\n");
    }

    for year in breakdown_years(months) {
        lines.push(format!("## {year}"));
        lines.push(String::new());
        lines.push("| month | CVEs | min | q1 | median | q3 | max | mean |".to_string());
        lines.push("|---|---|---|---|---|---|---|---|".to_string());
        for month in months.iter().filter(|m| m.year == year) {
            let s = &month.base_score;
            lines.push(format!(
                "| {} | {} | {:.1} | {:.2} | {:.2} | {:.2} | {:.1} | {:.2} |",
                month.label(),
                month.cve_count,
                s.min,
                s.q1,
                s.median,
                s.q3,
                s.max,
                s.mean
            ));
        }
        lines.push(String::new());
    }

    lines.push("## Base Severity".to_string());
    lines.push(String::new());
    for month in months {
        let severities = month
            .categories
            .iter()
            .filter(|c| c.dimension == "base_severity")
            .map(|c| format!("{} {}", c.category, c.count))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("- {}: {severities}", month.label()));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_monthly_parquet(path: &Path, months: &[MonthlyCvssV3]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("month", DataType::UInt32, false),
        ArrowField::new("cve_count", DataType::UInt64, false),
        ArrowField::new("base_score_min", DataType::Float64, false),
        ArrowField::new("base_score_q1", DataType::Float64, false),
        ArrowField::new("base_score_median", DataType::Float64, false),
        ArrowField::new("base_score_q3", DataType::Float64, false),
        ArrowField::new("base_score_max", DataType::Float64, false),
        ArrowField::new("base_score_mean", DataType::Float64, false),
    ]));

    let score = |f: fn(&MonthlyCvssV3) -> f64| Float64Array::from(months.iter().map(f).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(months.iter().map(|m| m.year).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(months.iter().map(|m| m.month).collect::<Vec<_>>())),
            Arc::new(UInt64Array::from(
                months.iter().map(|m| m.cve_count as u64).collect::<Vec<_>>(),
            )),
            Arc::new(score(|m| m.base_score.min)),
            Arc::new(score(|m| m.base_score.q1)),
            Arc::new(score(|m| m.base_score.median)),
            Arc::new(score(|m| m.base_score.q3)),
            Arc::new(score(|m| m.base_score.max)),
            Arc::new(score(|m| m.base_score.mean)),
        ],
    )
    .context("building cvss_v3_monthly record batch")?;
    write_parquet(path, batch)
}

fn write_categories_parquet(path: &Path, months: &[MonthlyCvssV3]) -> Result<()> {
    let rows = months
        .iter()
        .flat_map(|m| m.categories.iter().map(move |c| (m.year, m.month, c)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("month", DataType::UInt32, false),
        ArrowField::new("dimension", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(rows.iter().map(|(y, _, _)| *y).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|(_, m, _)| *m).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, c)| Some(c.dimension.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, c)| Some(c.category.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|(_, _, c)| c.count as u64).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building cvss_v3_categories record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
