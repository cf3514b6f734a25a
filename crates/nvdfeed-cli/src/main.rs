use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nvdfeed_sync::{
    export_cvss_v3_report, CveStore, MemoryCveStore, PgCveStore, SyncConfig, SyncOperation,
    SyncPipeline, SyncRunSummary,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nvdfeed")]
#[command(about = "Mirror NVD JSON feeds into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the schema, download every yearly CVE feed and hydrate.
    Init,
    /// Apply the CVE modified feed when NVD has published a newer one.
    Update,
    /// Report whether the CVE modified feed is newer than the cached copy.
    CheckUpdate,
    /// Download the yearly CVE feeds that are not cached yet.
    Download,
    /// Hydrate the CVE table from cached yearly feeds.
    Hydrate,
    /// Download the CPE feeds and hydrate CPE matches.
    Cpe,
    /// Ingest a single CVE feed archive.
    IngestFile {
        path: PathBuf,
        /// Parse and dedup in memory without touching the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the database schema.
    Migrate,
    /// Export the monthly CVSS v3 breakdown.
    Report {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgCveStore>> {
    let store = PgCveStore::connect(&config.database_url, config.store_options())
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

async fn run_operation(config: SyncConfig, store: Arc<dyn CveStore>, operation: SyncOperation) -> Result<()> {
    let pipeline = SyncPipeline::new(config, store)?;
    let summary = pipeline.run(operation).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "{} complete: run_id={} downloaded={} reused={} written={} stale={} rejected={} cpe_matches={} reports={}",
        summary.operation,
        summary.run_id,
        summary.archives_downloaded.len(),
        summary.archives_reused.len(),
        summary.records_written,
        summary.records_stale,
        summary.records_rejected,
        summary.cpe_matches_written,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nvdfeed=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Update) {
        Commands::Init => {
            let store = connect(&config).await?;
            store.migrate().await?;
            run_operation(config, store, SyncOperation::Init).await?;
        }
        Commands::Update => {
            let store = connect(&config).await?;
            run_operation(config, store, SyncOperation::Update).await?;
        }
        Commands::CheckUpdate => {
            let pipeline = SyncPipeline::new(config, Arc::new(MemoryCveStore::new()))?;
            let check = pipeline.check_modified_feed().await?;
            let local = check
                .local_modified_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "not cached".to_string());
            println!(
                "modified feed: remote={} local={} newer={}",
                check.meta.last_modified.to_rfc3339(),
                local,
                check.is_newer
            );
        }
        Commands::Download => {
            run_operation(config, Arc::new(MemoryCveStore::new()), SyncOperation::Download).await?;
        }
        Commands::Hydrate => {
            let store = connect(&config).await?;
            run_operation(config, store, SyncOperation::Hydrate).await?;
        }
        Commands::Cpe => {
            let store = connect(&config).await?;
            run_operation(config, store, SyncOperation::Cpe).await?;
        }
        Commands::IngestFile { path, dry_run } => {
            let store: Arc<dyn CveStore> = if dry_run {
                info!("dry run: records are deduplicated in memory only");
                Arc::new(MemoryCveStore::new())
            } else {
                connect(&config).await?
            };
            let pipeline = SyncPipeline::new(config, store)?;
            let outcome = pipeline.ingest_archive_file(&path).await?;
            println!(
                "ingested {}: seen={} written={} stale={} rejected={}",
                path.display(),
                outcome.stats.seen,
                outcome.stats.written,
                outcome.stats.stale,
                outcome.rejected
            );
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { out } => {
            let out = out.unwrap_or_else(|| config.reports_dir.join("cvss_v3"));
            let store = connect(&config).await?;
            let report = export_cvss_v3_report(store.as_ref(), &out).await?;
            println!(
                "report complete: months={} markdown={} manifest={}",
                report.months.len(),
                report.markdown_path.display(),
                report.manifest_path.display()
            );
        }
    }

    Ok(())
}
