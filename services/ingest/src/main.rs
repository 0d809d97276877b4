//! Ingest Service - Loads one monthly NYC TLC trip partition into Postgres
//!
//! Responsibilities:
//! - Validate the (kind, year, month) run parameters before any side effect
//! - Fetch the partition's gzipped CSV from the public release archive and
//!   stage the decompressed bytes locally
//! - Normalize rows, assign deterministic row identities, drop in-batch
//!   duplicates
//! - Upsert the batch into the per-kind trip table in atomic chunks
//! - Record the run and its counts in ingest_runs
//!
//! Usage:
//!   # Ingest one partition:
//!   cargo run --bin ingest -- --taxi yellow --year 2020 --month 1
//!
//!   # Current month (the shape a scheduler submits):
//!   cargo run --bin ingest -- --taxi green
//!
//!   # Fetch and normalize without touching the warehouse:
//!   cargo run --bin ingest -- --taxi yellow --year 2019 --month 9 --dry-run

mod dedup;
mod error;
mod fetch;
mod identity;
mod load;
mod normalize;
mod params;
mod pipeline;
mod store;
#[cfg(test)]
mod testutil;

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::Parser;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::fetch::HttpFetcher;
use crate::params::{RunParams, TaxiKind};
use crate::pipeline::{RunOptions, RunOutcome, RunReport};
use crate::store::PgTripStore;

#[derive(Parser, Debug)]
#[command(
    name = "ingest",
    about = "Ingests one monthly taxi trip partition into the warehouse"
)]
struct Args {
    /// Dataset kind to ingest
    #[arg(long, value_enum)]
    taxi: TaxiKind,

    /// Partition year (defaults to the current year)
    #[arg(long)]
    year: Option<i32>,

    /// Partition month, 1-12 (defaults to the current month)
    #[arg(long)]
    month: Option<u32>,

    /// Override the configured chunk size
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Dry run - fetch and normalize but don't write to the warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Keep the staged CSV after a successful run
    #[arg(long, default_value = "false")]
    keep_staging: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    staging_dir: PathBuf,
    chunk_size: usize,
    fetch_timeout_secs: u64,
    fetch_attempts: u32,
    fetch_backoff_ms: u64,
    supported_years: RangeInclusive<i32>,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            staging_dir: PathBuf::from(
                std::env::var("STAGING_DIR").unwrap_or_else(|_| "./data/staging".to_string()),
            ),
            chunk_size: env_or("CHUNK_SIZE", load::DEFAULT_CHUNK_SIZE),
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", 120),
            fetch_attempts: env_or("FETCH_ATTEMPTS", 3),
            fetch_backoff_ms: env_or("FETCH_BACKOFF_MS", 500),
            supported_years: env_or("SUPPORTED_YEAR_MIN", 2009)..=env_or("SUPPORTED_YEAR_MAX", 2025),
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    // Scheduler-shaped defaults: a bare `--taxi yellow` means the current
    // month's partition.
    let now = Utc::now();
    let year = args.year.unwrap_or_else(|| now.year());
    let month = args.month.unwrap_or_else(|| now.month());

    // Validation of all three parameters happens here, before anything can
    // touch the network or the warehouse.
    let params = RunParams::new(args.taxi, year, month, &config.supported_years)?;
    let chunk_size = args
        .chunk_size
        .unwrap_or(config.chunk_size)
        .clamp(1, load::MAX_CHUNK_SIZE);

    println!("=== Taxi Warehouse Ingest ===");
    println!("Partition: {}", params.partition_label());
    println!("Chunk size: {}", chunk_size);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    println!();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent("taxi-warehouse-ingest/0.1")
        .build()
        .context("Failed to build HTTP client")?;
    let fetcher = HttpFetcher::new(
        client,
        config.staging_dir.clone(),
        config.fetch_attempts,
        Duration::from_millis(config.fetch_backoff_ms),
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;
    let store = PgTripStore::new(pool.clone());

    // One in-flight run per partition: hold a session-scoped advisory lock
    // for the duration. Dry runs write nothing and skip the lease.
    let lease = if args.dry_run {
        None
    } else {
        match PartitionLease::acquire(&config.db_url, &params).await? {
            Some(lease) => Some(lease),
            None => anyhow::bail!(
                "another ingest run already holds the lease for {}",
                params.partition_label()
            ),
        }
    };

    let run_id = if args.dry_run {
        None
    } else {
        ensure_run_bookkeeping(&pool).await?;
        Some(create_ingest_run(&pool, &params).await?)
    };

    // Ctrl-C asks the loader to stop between chunks; the chunk in flight
    // still commits or fails atomically.
    let cancel = CancellationToken::new();
    let signal_watch = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current chunk");
                cancel.cancel();
            }
        })
    };

    let options = RunOptions {
        chunk_size,
        dry_run: args.dry_run,
        keep_staging: args.keep_staging,
    };
    let outcome = pipeline::run(&fetcher, &store, &params, &options, &cancel).await;
    signal_watch.abort();

    if let Some(run_id) = run_id {
        let (status, error_text) = match &outcome.error {
            None => ("ok", None),
            Some(error) => (error.kind(), Some(error.to_string())),
        };
        if let Err(error) =
            finish_ingest_run(&pool, run_id, status, error_text.as_deref(), &outcome.report).await
        {
            warn!(%error, "failed to record run outcome");
        }
    }

    if let Some(lease) = lease {
        lease.release().await;
    }

    print_summary(&params, &outcome);

    match outcome.error {
        Some(error) => Err(anyhow::Error::new(error).context("ingest run failed")),
        None => {
            println!("\nPartition {} is up to date.", params.partition_label());
            Ok(())
        }
    }
}

fn print_summary(params: &RunParams, outcome: &RunOutcome) {
    let report = &outcome.report;
    println!("\n=== Ingest Summary ===");
    println!("Partition: {}", params.partition_label());
    if let Some(file) = &report.source_file {
        println!("Source file: {}", file);
    }
    println!("Rows fetched: {}", report.rows_fetched);
    println!("Rows normalized: {}", report.rows_normalized);
    println!("Rows skipped: {}", report.rows_skipped);
    for (reason, count) in &report.skipped_by_reason {
        println!("  - {}: {}", reason, count);
    }
    println!("Duplicates dropped: {}", report.duplicates_dropped);
    println!("Rows loaded: {}", report.rows_loaded);
    println!(
        "Chunks committed: {}/{}",
        report.chunks_committed, report.chunks_planned
    );
    match &outcome.error {
        None => println!("Status: ok"),
        Some(error) => println!("Status: failed ({})", error),
    }
}

// =============================================================================
// Run bookkeeping
// =============================================================================

async fn ensure_run_bookkeeping(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            year INT NOT NULL,
            month INT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            finished_at TIMESTAMPTZ,
            status TEXT NOT NULL,
            error TEXT,
            detail JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create ingest_runs table")?;
    Ok(())
}

async fn create_ingest_run(pool: &PgPool, params: &RunParams) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO ingest_runs (run_id, kind, year, month, status)
        VALUES ($1, $2, $3, $4, 'running')
        "#,
    )
    .bind(run_id)
    .bind(params.kind().as_str())
    .bind(params.year())
    .bind(params.month() as i32)
    .execute(pool)
    .await
    .context("Failed to create ingest run record")?;
    info!(%run_id, partition = %params.partition_label(), "run recorded");
    Ok(run_id)
}

/// Counts go into `detail` as JSON whether the run succeeded or not, so a
/// partial failure is as visible as a clean run.
async fn finish_ingest_run(
    pool: &PgPool,
    run_id: Uuid,
    status: &str,
    error: Option<&str>,
    report: &RunReport,
) -> Result<()> {
    let detail = serde_json::to_value(report).unwrap_or_else(|_| serde_json::json!({}));
    sqlx::query(
        r#"
        UPDATE ingest_runs
        SET finished_at = now(), status = $2, error = $3, detail = $4
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await
    .context("Failed to finish ingest run record")?;
    Ok(())
}

// =============================================================================
// Partition lease
// =============================================================================

/// Advisory lock key for a partition: the first eight bytes of the SHA-256
/// of its label, as a signed 64-bit integer.
fn lease_key(params: &RunParams) -> i64 {
    let digest = Sha256::digest(params.partition_label().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// A held `pg_try_advisory_lock` on a dedicated session. The lock lives
/// exactly as long as the session, so a crashed run cannot leak it.
struct PartitionLease {
    conn: PgConnection,
}

impl PartitionLease {
    async fn acquire(db_url: &str, params: &RunParams) -> Result<Option<Self>> {
        let mut conn = PgConnection::connect(db_url)
            .await
            .context("Failed to open lease connection")?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lease_key(params))
            .fetch_one(&mut conn)
            .await
            .context("Failed to take partition lease")?;
        if locked {
            info!(partition = %params.partition_label(), "partition lease acquired");
            Ok(Some(Self { conn }))
        } else {
            let _ = conn.close().await;
            Ok(None)
        }
    }

    async fn release(self) {
        // Closing the session releases the advisory lock.
        if let Err(error) = self.conn.close().await {
            warn!(%error, "failed to close lease connection");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
