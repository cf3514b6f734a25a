use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nvdfeed_core::{FeedArchive, FeedEndpoints};
use nvdfeed_feeds::parse_feed_meta;
use nvdfeed_sync::{
    export_cvss_v3_report, CveStore, MemoryCveStore, SyncConfig, SyncOperation, SyncPipeline,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/nvd")
        .join(name)
}

fn zip_single(member: &str, body: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(member, SimpleFileOptions::default()).unwrap();
    writer.write_all(body).unwrap();
    writer.finish().unwrap().into_inner()
}

fn zip_fixture(archive: FeedArchive, fixture_name: &str) -> Vec<u8> {
    let body = std::fs::read(fixture(fixture_name)).unwrap();
    zip_single(&archive.member_name(), &body)
}

struct Harness {
    _root: TempDir,
    config: SyncConfig,
    store: Arc<MemoryCveStore>,
    pipeline: SyncPipeline,
}

fn harness() -> Harness {
    harness_through(2002)
}

fn harness_through(last_year: i32) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        database_url: "postgres://unused".to_string(),
        cve_data_dir: root.path().join("cve"),
        cpe_data_dir: root.path().join("cpe"),
        reports_dir: root.path().join("reports"),
        endpoints: FeedEndpoints {
            cve_base_url: "http://127.0.0.1:9/cve".to_string(),
            cpe_match_url: "http://127.0.0.1:9/cpematch.zip".to_string(),
            cpe_dictionary_url: "http://127.0.0.1:9/dictionary.zip".to_string(),
        },
        first_year: 2002,
        last_year: Some(last_year),
        download_interval_secs: 0,
        user_agent: "nvdfeed-test".to_string(),
        http_timeout_secs: 5,
        db_max_connections: 1,
    };
    let store = Arc::new(MemoryCveStore::new());
    let pipeline = SyncPipeline::new(config.clone(), store.clone()).unwrap();
    Harness {
        _root: root,
        config,
        store,
        pipeline,
    }
}

fn seed(dir: &Path, archive: FeedArchive, bytes: &[u8]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(archive.file_name());
    std::fs::write(&path, bytes).unwrap();
    path
}

#[tokio::test]
async fn hydrate_requires_cached_year_archives() {
    let h = harness();
    let err = h.pipeline.hydrate_cve().await.unwrap_err();
    assert!(err.to_string().contains("nvdcve-1.1-2002.json.zip"));
    assert!(!h.store.has_cves().await.unwrap());
}

#[tokio::test]
async fn hydrate_writes_nothing_until_every_year_is_cached() {
    let h = harness_through(2003);
    let year_2002 = FeedArchive::CveYear(2002);
    seed(
        &h.config.cve_data_dir,
        year_2002,
        &zip_fixture(year_2002, "nvdcve-1.1-2002.sample.json"),
    );

    let err = h.pipeline.hydrate_cve().await.unwrap_err();
    assert!(err.to_string().contains("nvdcve-1.1-2003.json.zip"));
    assert_eq!(h.store.cve_row_count().await, 0);
    assert!(!h.store.has_cves().await.unwrap());

    let year_2003 = FeedArchive::CveYear(2003);
    seed(
        &h.config.cve_data_dir,
        year_2003,
        &zip_fixture(year_2003, "nvdcve-1.1-modified.sample.json"),
    );
    let hydrated = h.pipeline.hydrate_cve().await.unwrap();
    assert!(!hydrated.skipped);
    assert_eq!(hydrated.archives, 2);
    assert_eq!(hydrated.stats.written, 4);
    assert_eq!(h.store.cve_row_count().await, 4);
}

#[tokio::test]
async fn year_then_modified_feed_appends_only_newer_versions() {
    let h = harness();
    let year = FeedArchive::CveYear(2002);
    seed(
        &h.config.cve_data_dir,
        year,
        &zip_fixture(year, "nvdcve-1.1-2002.sample.json"),
    );

    let hydrated = h.pipeline.hydrate_cve().await.unwrap();
    assert!(!hydrated.skipped);
    assert_eq!(hydrated.archives, 1);
    assert_eq!(hydrated.stats.seen, 2);
    assert_eq!(hydrated.stats.written, 2);
    assert_eq!(hydrated.rejected, 1);

    let modified_path = seed(
        &h._root.path().join("incoming"),
        FeedArchive::CveModified,
        &zip_fixture(FeedArchive::CveModified, "nvdcve-1.1-modified.sample.json"),
    );
    let first = h.pipeline.ingest_archive_file(&modified_path).await.unwrap();
    assert_eq!(first.stats.seen, 2);
    assert_eq!(first.stats.written, 2);

    let again = h.pipeline.ingest_archive_file(&modified_path).await.unwrap();
    assert_eq!(again.stats.written, 0);
    assert_eq!(again.stats.stale, 2);

    let versions = h.store.versions("CVE-2002-0059").await;
    assert_eq!(versions.len(), 2);
    assert!(versions[0].last_modified_date < versions[1].last_modified_date);
    assert_eq!(h.store.versions("CVE-2021-44228").await.len(), 1);
    assert_eq!(h.store.versions("CVE-1999-0001").await.len(), 1);
    assert_eq!(h.store.cve_row_count().await, 4);
}

#[tokio::test]
async fn second_hydrate_run_is_skipped_and_reported() {
    let h = harness();
    let year = FeedArchive::CveYear(2002);
    seed(
        &h.config.cve_data_dir,
        year,
        &zip_fixture(year, "nvdcve-1.1-2002.sample.json"),
    );

    let first = h.pipeline.run(SyncOperation::Hydrate).await.unwrap();
    assert_eq!(first.records_written, 2);
    assert_eq!(first.records_rejected, 1);
    assert!(!first.hydrate_skipped);

    let second = h.pipeline.run(SyncOperation::Hydrate).await.unwrap();
    assert!(second.hydrate_skipped);
    assert_eq!(second.records_seen, 0);

    let report_dir = h.config.reports_dir.join(second.run_id.to_string());
    assert!(report_dir.join("run_summary.json").exists());
    assert!(report_dir.join("summary.md").exists());
}

#[tokio::test]
async fn download_reuses_cached_archives_without_network() {
    let h = harness();
    let year = FeedArchive::CveYear(2002);
    seed(&h.config.cve_data_dir, year, b"cached");

    let outcome = h.pipeline.download_cve_year_feeds().await.unwrap();
    assert!(outcome.downloaded.is_empty());
    assert_eq!(outcome.reused, vec!["nvdcve-1.1-2002.json.zip".to_string()]);
}

#[tokio::test]
async fn modified_archive_is_applied_only_when_checksum_matches() {
    let h = harness();
    let meta_text = std::fs::read_to_string(fixture("nvdcve-1.1-modified.sample.meta")).unwrap();
    let meta = parse_feed_meta(&meta_text).unwrap();
    let archive = zip_fixture(FeedArchive::CveModified, "nvdcve-1.1-modified.sample.json");

    let mut tampered = meta.clone();
    tampered.sha256 = "00".repeat(32);
    let err = h
        .pipeline
        .apply_modified_archive(&tampered, &archive)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));
    assert!(!h.config.cve_data_dir.join("nvdcve-1.1-modified.json.zip").exists());
    assert!(!h.store.has_cves().await.unwrap());

    let applied = h.pipeline.apply_modified_archive(&meta, &archive).await.unwrap();
    assert_eq!(applied.stats.written, 2);
    assert!(h.config.cve_data_dir.join("nvdcve-1.1-modified.json.zip").exists());
}

#[tokio::test]
async fn cpe_matches_hydrate_once() {
    let h = harness();
    seed(
        &h.config.cpe_data_dir,
        FeedArchive::CpeMatch,
        &zip_fixture(FeedArchive::CpeMatch, "nvdcpematch-1.0.sample.json"),
    );

    let first = h.pipeline.hydrate_cpe_matches().await.unwrap();
    assert_eq!(first.written, 2);
    assert_eq!(first.rejected, 1);
    assert_eq!(h.store.cpe_match_count().await, 2);

    let second = h.pipeline.hydrate_cpe_matches().await.unwrap();
    assert!(second.skipped);
    assert_eq!(h.store.cpe_match_count().await, 2);
}

#[tokio::test]
async fn report_export_covers_latest_v3_scores() {
    let h = harness();
    let year = FeedArchive::CveYear(2002);
    seed(
        &h.config.cve_data_dir,
        year,
        &zip_fixture(year, "nvdcve-1.1-2002.sample.json"),
    );
    h.pipeline.hydrate_cve().await.unwrap();

    let out = h._root.path().join("report");
    let report = export_cvss_v3_report(h.store.as_ref(), &out).await.unwrap();
    assert_eq!(report.months.len(), 1);
    assert_eq!(report.months[0].label(), "2002-03");
    assert_eq!(report.months[0].count_of("base_severity", "CRITICAL"), Some(1));

    assert!(out.join("monthly_breakdown.md").exists());
    assert!(out.join("snapshots/cvss_v3_monthly.parquet").exists());
    assert!(out.join("snapshots/cvss_v3_categories.parquet").exists());
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&report.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["files"].as_array().unwrap().len(), 3);
}
