//! Zones Service - Replace-loads the taxi zone lookup table
//!
//! The trip tables store TLC location ids; this companion loader fills
//! `taxi_zone_lookup` from the public lookup CSV so those ids resolve to
//! borough and zone names. The table is small and changes rarely, so every
//! run replaces it wholesale inside one transaction.
//!
//! Usage:
//!   cargo run --bin zones
//!   cargo run --bin zones -- --dry-run
//!   cargo run --bin zones -- --url https://example.com/taxi_zone_lookup.csv

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ZONES_URL: &str = "https://d37ci6vzurychx.cloudfront.net/misc/taxi_zone_lookup.csv";

#[derive(Parser, Debug)]
#[command(name = "zones", about = "Replace-loads the taxi zone lookup table")]
struct Args {
    /// Source CSV (defaults to the public TLC zone lookup)
    #[arg(long, default_value = DEFAULT_ZONES_URL)]
    url: String,

    /// Dry run - fetch and parse but don't write to the warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ZoneRow {
    #[serde(rename = "LocationID")]
    location_id: i64,
    #[serde(rename = "Borough")]
    borough: String,
    #[serde(rename = "Zone")]
    zone: String,
    #[serde(rename = "service_zone")]
    service_zone: String,
}

/// The lookup file is small and curated, so unlike trip ingestion any bad
/// row here is treated as a broken download and fails the run.
fn parse_zones(content: &str) -> Result<Vec<ZoneRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut zones = Vec::new();
    for (index, result) in reader.deserialize().enumerate() {
        let row: ZoneRow = result.with_context(|| format!("zone lookup line {}", index + 2))?;
        zones.push(row);
    }
    if zones.is_empty() {
        anyhow::bail!("zone lookup file contained no rows");
    }
    Ok(zones)
}

async fn replace_zones(pool: &PgPool, zones: &[ZoneRow]) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to open transaction")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS taxi_zone_lookup (
            location_id BIGINT PRIMARY KEY,
            borough TEXT NOT NULL,
            zone TEXT NOT NULL,
            service_zone TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create taxi_zone_lookup table")?;

    sqlx::query("TRUNCATE TABLE taxi_zone_lookup")
        .execute(&mut *tx)
        .await
        .context("Failed to truncate taxi_zone_lookup")?;

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO taxi_zone_lookup (location_id, borough, zone, service_zone) ",
    );
    builder.push_values(zones, |mut b, zone| {
        b.push_bind(zone.location_id)
            .push_bind(zone.borough.as_str())
            .push_bind(zone.zone.as_str())
            .push_bind(zone.service_zone.as_str());
    });
    builder
        .build()
        .execute(&mut *tx)
        .await
        .context("Failed to insert zone rows")?;

    tx.commit().await.context("Failed to commit zone load")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    println!("=== Taxi Warehouse Zones ===");
    println!("Source: {}", args.url);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    println!();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .user_agent("taxi-warehouse-zones/0.1")
        .build()
        .context("Failed to build HTTP client")?;

    info!(url = args.url.as_str(), "fetching zone lookup");
    let content = client
        .get(&args.url)
        .send()
        .await
        .context("Failed to fetch zone lookup")?
        .error_for_status()
        .context("Zone lookup request was rejected")?
        .text()
        .await
        .context("Failed to read zone lookup body")?;

    let zones = parse_zones(&content)?;
    info!(rows = zones.len(), "parsed zone lookup");

    if args.dry_run {
        println!("Dry run - parsed {} zones, nothing written", zones.len());
        return Ok(());
    }

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    replace_zones(&pool, &zones).await?;

    println!("\n=== Zones Load Complete ===");
    println!("Rows loaded: {}", zones.len());
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
