//! Monthly CVSS v3 breakdown: score distribution and per-dimension category
//! counts, grouped by publication month.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Datelike;
use nvdfeed_core::CvssV3Metrics;
use serde::Serialize;

use crate::store::CvssV3Observation;

/// Dimensions reported per month, each with its fixed category order.
pub const CATEGORY_DIMENSIONS: &[(&str, &[&str])] = &[
    ("base_severity", &["LOW", "MEDIUM", "HIGH", "CRITICAL"]),
    ("attack_vector", &["ADJACENT_NETWORK", "LOCAL", "NETWORK", "PHYSICAL"]),
    ("attack_complexity", &["LOW", "HIGH"]),
    ("privileges_required", &["NONE", "LOW", "HIGH"]),
    ("user_interaction", &["NONE", "REQUIRED"]),
    ("confidentiality_impact", &["NONE", "LOW", "HIGH"]),
    ("integrity_impact", &["NONE", "LOW", "HIGH"]),
    ("availability_impact", &["NONE", "LOW", "HIGH"]),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub dimension: String,
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyCvssV3 {
    pub year: i32,
    pub month: u32,
    pub cve_count: usize,
    pub base_score: ScoreSummary,
    pub categories: Vec<CategoryCount>,
}

impl MonthlyCvssV3 {
    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn count_of(&self, dimension: &str, category: &str) -> Option<usize> {
        self.categories
            .iter()
            .find(|c| c.dimension == dimension && c.category == category)
            .map(|c| c.count)
    }
}

fn dimension_value<'a>(metrics: &'a CvssV3Metrics, dimension: &str) -> Option<&'a str> {
    match dimension {
        "base_severity" => Some(metrics.base_severity.as_str()),
        "attack_vector" => metrics.attack_vector.as_deref(),
        "attack_complexity" => metrics.attack_complexity.as_deref(),
        "privileges_required" => metrics.privileges_required.as_deref(),
        "user_interaction" => metrics.user_interaction.as_deref(),
        "confidentiality_impact" => metrics.confidentiality_impact.as_deref(),
        "integrity_impact" => metrics.integrity_impact.as_deref(),
        "availability_impact" => metrics.availability_impact.as_deref(),
        _ => None,
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
}

fn summarize(mut scores: Vec<f64>) -> Option<ScoreSummary> {
    if scores.is_empty() {
        return None;
    }
    scores.sort_by(f64::total_cmp);
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    Some(ScoreSummary {
        min: scores[0],
        q1: quantile(&scores, 0.25),
        median: quantile(&scores, 0.5),
        q3: quantile(&scores, 0.75),
        max: scores[scores.len() - 1],
        mean,
    })
}

fn category_counts(group: &[&CvssV3Observation]) -> Vec<CategoryCount> {
    let mut out = Vec::new();
    for (dimension, order) in CATEGORY_DIMENSIONS {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for observation in group {
            if let Some(value) = dimension_value(&observation.metrics, dimension) {
                *counts.entry(value).or_default() += 1;
            }
        }
        for category in order.iter() {
            out.push(CategoryCount {
                dimension: dimension.to_string(),
                category: category.to_string(),
                count: counts.remove(category).unwrap_or(0),
            });
        }
        // Whatever remains is outside the known order; BTreeMap keeps it sorted.
        for (category, count) in counts {
            out.push(CategoryCount {
                dimension: dimension.to_string(),
                category: category.to_string(),
                count,
            });
        }
    }
    out
}

/// Groups observations by the published date's (year, month), oldest first.
pub fn monthly_cvss_v3_breakdown(observations: &[CvssV3Observation]) -> Vec<MonthlyCvssV3> {
    let mut groups: BTreeMap<(i32, u32), Vec<&CvssV3Observation>> = BTreeMap::new();
    for observation in observations {
        let date = observation.published_date.date();
        groups
            .entry((date.year(), date.month()))
            .or_default()
            .push(observation);
    }

    groups
        .into_iter()
        .filter_map(|((year, month), group)| {
            let base_score = summarize(group.iter().map(|o| o.metrics.base_score).collect())?;
            Some(MonthlyCvssV3 {
                year,
                month,
                cve_count: group.len(),
                base_score,
                categories: category_counts(&group),
            })
        })
        .collect()
}

/// Distinct years present in a breakdown, for report headings.
pub fn breakdown_years(months: &[MonthlyCvssV3]) -> BTreeSet<i32> {
    months.iter().map(|m| m.year).collect()
}
