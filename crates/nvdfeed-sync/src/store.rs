//! CVE persistence: the store trait, its PostgreSQL and in-memory
//! implementations, and the versioned ingest built on top of them.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use nvdfeed_core::{supersedes, CpeMatchRecord, CveRecord, CvssV3Metrics};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Latest CVSS v3 scoring of one CVE, as consumed by the monthly breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvssV3Observation {
    pub cve_id: String,
    pub published_date: NaiveDateTime,
    pub metrics: CvssV3Metrics,
}

#[async_trait]
pub trait CveStore: Send + Sync {
    /// Highest stored `last_modified_date` for `cve_id`.
    async fn latest_last_modified(&self, cve_id: &str) -> Result<Option<NaiveDateTime>>;

    /// Appends a CVE version. Returns `false` when the same
    /// `(cve_id, last_modified_date)` pair was already stored.
    async fn insert_cve(&self, record: &CveRecord) -> Result<bool>;

    async fn has_cves(&self) -> Result<bool>;

    async fn has_cpe_matches(&self) -> Result<bool>;

    /// Inserts every match or none of them. Returns the number written.
    async fn insert_cpe_matches(&self, records: &[CpeMatchRecord]) -> Result<usize>;

    /// Most recent version of every CVE that carries CVSS v3 metrics.
    async fn cvss_v3_observations(&self) -> Result<Vec<CvssV3Observation>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub seen: usize,
    pub written: usize,
    pub stale: usize,
}

impl IngestStats {
    pub fn absorb(&mut self, other: IngestStats) {
        self.seen += other.seen;
        self.written += other.written;
        self.stale += other.stale;
    }
}

/// Writes each record whose `last_modified_date` is strictly newer than the
/// stored one for its CVE. Records are applied in the given order, so later
/// duplicates within the same batch are compared against earlier writes.
pub async fn ingest_cve_records(store: &dyn CveStore, records: Vec<CveRecord>) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    for record in records {
        stats.seen += 1;
        let stored = store
            .latest_last_modified(&record.cve_id)
            .await
            .with_context(|| format!("looking up {}", record.cve_id))?;
        if !supersedes(record.last_modified_date, stored) {
            stats.stale += 1;
            continue;
        }
        if store
            .insert_cve(&record)
            .await
            .with_context(|| format!("inserting {}", record.cve_id))?
        {
            stats.written += 1;
        } else {
            debug!(cve_id = %record.cve_id, "concurrent writer already stored this version");
            stats.stale += 1;
        }
    }
    Ok(stats)
}

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

pub struct PgCveStore {
    pool: PgPool,
}

impl PgCveStore {
    pub async fn connect(database_url: &str, options: PgStoreOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .max_lifetime(options.max_lifetime)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl CveStore for PgCveStore {
    async fn latest_last_modified(&self, cve_id: &str) -> Result<Option<NaiveDateTime>> {
        let row = sqlx::query("SELECT MAX(last_modified_date) AS latest FROM cve WHERE cve_id = $1")
            .bind(cve_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }

    async fn insert_cve(&self, record: &CveRecord) -> Result<bool> {
        let v3 = record.cvss_v3.as_ref();
        let v2 = record.cvss_v2.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO cve (
                cve_id, description,
                cvss_v3_version, cvss_v3_vector_string, cvss_v3_base_score, cvss_v3_base_severity,
                cvss_v3_impact_score, cvss_v3_exploitability_score,
                cvss_v3_attack_vector, cvss_v3_attack_complexity, cvss_v3_privileges_required,
                cvss_v3_user_interaction, cvss_v3_scope,
                cvss_v3_confidentiality_impact, cvss_v3_integrity_impact, cvss_v3_availability_impact,
                cvss_v2_version, cvss_v2_vector_string, cvss_v2_base_score, cvss_v2_severity,
                cvss_v2_impact_score, cvss_v2_exploitability_score,
                cvss_v2_access_vector, cvss_v2_access_complexity, cvss_v2_authentication,
                published_date, last_modified_date, full_cve_json
            )
            VALUES (
                $1, $2,
                $3, $4, $5, $6,
                $7, $8,
                $9, $10, $11,
                $12, $13,
                $14, $15, $16,
                $17, $18, $19, $20,
                $21, $22,
                $23, $24, $25,
                $26, $27, $28
            )
            ON CONFLICT (cve_id, last_modified_date) DO NOTHING
            "#,
        )
        .bind(&record.cve_id)
        .bind(&record.description)
        .bind(v3.and_then(|m| m.version.as_deref()))
        .bind(v3.and_then(|m| m.vector_string.as_deref()))
        .bind(v3.map(|m| m.base_score))
        .bind(v3.map(|m| m.base_severity.as_str()))
        .bind(v3.and_then(|m| m.impact_score))
        .bind(v3.and_then(|m| m.exploitability_score))
        .bind(v3.and_then(|m| m.attack_vector.as_deref()))
        .bind(v3.and_then(|m| m.attack_complexity.as_deref()))
        .bind(v3.and_then(|m| m.privileges_required.as_deref()))
        .bind(v3.and_then(|m| m.user_interaction.as_deref()))
        .bind(v3.and_then(|m| m.scope.as_deref()))
        .bind(v3.and_then(|m| m.confidentiality_impact.as_deref()))
        .bind(v3.and_then(|m| m.integrity_impact.as_deref()))
        .bind(v3.and_then(|m| m.availability_impact.as_deref()))
        .bind(v2.and_then(|m| m.version.as_deref()))
        .bind(v2.and_then(|m| m.vector_string.as_deref()))
        .bind(v2.map(|m| m.base_score))
        .bind(v2.and_then(|m| m.severity.as_deref()))
        .bind(v2.and_then(|m| m.impact_score))
        .bind(v2.and_then(|m| m.exploitability_score))
        .bind(v2.and_then(|m| m.access_vector.as_deref()))
        .bind(v2.and_then(|m| m.access_complexity.as_deref()))
        .bind(v2.and_then(|m| m.authentication.as_deref()))
        .bind(record.published_date)
        .bind(record.last_modified_date)
        .bind(&record.full_cve_json)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_cves(&self) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM cve) AS present")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn has_cpe_matches(&self) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM cpe_match) AS present")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_cpe_matches(&self, records: &[CpeMatchRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("starting cpe_match transaction")?;
        for record in records {
            sqlx::query(
                "INSERT INTO cpe_match (cpe_23_uri, cpe_name, full_cpe_match_json) VALUES ($1, $2, $3)",
            )
            .bind(&record.cpe_23_uri)
            .bind(record.cpe_name.as_deref())
            .bind(&record.full_cpe_match_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting CPE match {}", record.cpe_23_uri))?;
        }
        tx.commit().await.context("committing cpe_match rows")?;
        Ok(records.len())
    }

    async fn cvss_v3_observations(&self) -> Result<Vec<CvssV3Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (cve_id)
                   cve_id, published_date,
                   cvss_v3_version, cvss_v3_vector_string, cvss_v3_base_score, cvss_v3_base_severity,
                   cvss_v3_impact_score, cvss_v3_exploitability_score,
                   cvss_v3_attack_vector, cvss_v3_attack_complexity, cvss_v3_privileges_required,
                   cvss_v3_user_interaction, cvss_v3_scope,
                   cvss_v3_confidentiality_impact, cvss_v3_integrity_impact, cvss_v3_availability_impact
              FROM cve
             ORDER BY cve_id, last_modified_date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let base_score: Option<f64> = row.try_get("cvss_v3_base_score")?;
            let base_severity: Option<String> = row.try_get("cvss_v3_base_severity")?;
            let (Some(base_score), Some(base_severity)) = (base_score, base_severity) else {
                continue;
            };
            out.push(CvssV3Observation {
                cve_id: row.try_get("cve_id")?,
                published_date: row.try_get("published_date")?,
                metrics: CvssV3Metrics {
                    version: row.try_get("cvss_v3_version")?,
                    vector_string: row.try_get("cvss_v3_vector_string")?,
                    base_score,
                    base_severity,
                    impact_score: row.try_get("cvss_v3_impact_score")?,
                    exploitability_score: row.try_get("cvss_v3_exploitability_score")?,
                    attack_vector: row.try_get("cvss_v3_attack_vector")?,
                    attack_complexity: row.try_get("cvss_v3_attack_complexity")?,
                    privileges_required: row.try_get("cvss_v3_privileges_required")?,
                    user_interaction: row.try_get("cvss_v3_user_interaction")?,
                    scope: row.try_get("cvss_v3_scope")?,
                    confidentiality_impact: row.try_get("cvss_v3_confidentiality_impact")?,
                    integrity_impact: row.try_get("cvss_v3_integrity_impact")?,
                    availability_impact: row.try_get("cvss_v3_availability_impact")?,
                },
            });
        }
        Ok(out)
    }
}

#[derive(Default)]
struct MemoryTables {
    cves: HashMap<String, Vec<CveRecord>>,
    cpe_matches: Vec<CpeMatchRecord>,
}

/// Process-local store with the same append-only contract as [`PgCveStore`].
#[derive(Default)]
pub struct MemoryCveStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryCveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored version of `cve_id`, oldest first.
    pub async fn versions(&self, cve_id: &str) -> Vec<CveRecord> {
        let tables = self.tables.lock().await;
        let mut versions = tables.cves.get(cve_id).cloned().unwrap_or_default();
        versions.sort_by_key(|r| r.last_modified_date);
        versions
    }

    pub async fn cve_row_count(&self) -> usize {
        self.tables.lock().await.cves.values().map(Vec::len).sum()
    }

    pub async fn cpe_match_count(&self) -> usize {
        self.tables.lock().await.cpe_matches.len()
    }
}

#[async_trait]
impl CveStore for MemoryCveStore {
    async fn latest_last_modified(&self, cve_id: &str) -> Result<Option<NaiveDateTime>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .cves
            .get(cve_id)
            .and_then(|versions| versions.iter().map(|r| r.last_modified_date).max()))
    }

    async fn insert_cve(&self, record: &CveRecord) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let versions = tables.cves.entry(record.cve_id.clone()).or_default();
        if versions
            .iter()
            .any(|r| r.last_modified_date == record.last_modified_date)
        {
            return Ok(false);
        }
        versions.push(record.clone());
        Ok(true)
    }

    async fn has_cves(&self) -> Result<bool> {
        Ok(!self.tables.lock().await.cves.is_empty())
    }

    async fn has_cpe_matches(&self) -> Result<bool> {
        Ok(!self.tables.lock().await.cpe_matches.is_empty())
    }

    async fn insert_cpe_matches(&self, records: &[CpeMatchRecord]) -> Result<usize> {
        self.tables
            .lock()
            .await
            .cpe_matches
            .extend_from_slice(records);
        Ok(records.len())
    }

    async fn cvss_v3_observations(&self) -> Result<Vec<CvssV3Observation>> {
        let tables = self.tables.lock().await;
        let mut out = tables
            .cves
            .values()
            .filter_map(|versions| versions.iter().max_by_key(|r| r.last_modified_date))
            .filter_map(|latest| {
                latest.cvss_v3.clone().map(|metrics| CvssV3Observation {
                    cve_id: latest.cve_id.clone(),
                    published_date: latest.published_date,
                    metrics,
                })
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.cve_id.cmp(&b.cve_id));
        Ok(out)
    }
}
