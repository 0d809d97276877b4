//! Warehouse write path: table bootstrap and chunk upserts.
//!
//! Each dataset kind targets its own table. A chunk upsert is one multi-row
//! `INSERT ... ON CONFLICT (row_id) DO UPDATE` statement, so a chunk either
//! applies in full or not at all, and re-ingesting a partition rewrites rows
//! in place.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

use crate::identity::KeyedRow;
use crate::params::TaxiKind;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("warehouse connection: {0}")]
    Connection(String),

    #[error("warehouse query: {0}")]
    Query(String),
}

/// Write access to the per-kind trip tables. The pipeline only ever needs
/// these two calls; tests substitute an in-memory fixture.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn ensure_table(&self, kind: TaxiKind) -> Result<(), StoreError>;

    /// Atomically upsert one chunk of rows into the kind's table.
    async fn upsert_chunk(
        &self,
        kind: TaxiKind,
        source_file: &str,
        rows: &[KeyedRow],
    ) -> Result<(), StoreError>;
}

pub fn target_table(kind: TaxiKind) -> &'static str {
    match kind {
        TaxiKind::Yellow => "yellow_trips",
        TaxiKind::Green => "green_trips",
    }
}

// =============================================================================
// SQL shapes
// =============================================================================

const CORE_COLUMNS_DDL: &str = "\
    row_id TEXT PRIMARY KEY,
    source_file TEXT NOT NULL,
    vendor_id TEXT,
    pickup_at TIMESTAMP NOT NULL,
    dropoff_at TIMESTAMP NOT NULL,
    store_and_fwd_flag TEXT,
    ratecode_id TEXT,
    pu_location_id TEXT,
    do_location_id TEXT,
    passenger_count BIGINT,
    trip_distance DOUBLE PRECISION,
    fare_amount DOUBLE PRECISION,
    extra DOUBLE PRECISION,
    mta_tax DOUBLE PRECISION,
    tip_amount DOUBLE PRECISION,
    tolls_amount DOUBLE PRECISION,
    improvement_surcharge DOUBLE PRECISION,
    total_amount DOUBLE PRECISION,
    congestion_surcharge DOUBLE PRECISION,
    payment_type BIGINT";

const GREEN_EXTRA_DDL: &str = ",
    ehail_fee DOUBLE PRECISION,
    trip_type BIGINT";

const CORE_COLUMN_NAMES: &[&str] = &[
    "row_id",
    "source_file",
    "vendor_id",
    "pickup_at",
    "dropoff_at",
    "store_and_fwd_flag",
    "ratecode_id",
    "pu_location_id",
    "do_location_id",
    "passenger_count",
    "trip_distance",
    "fare_amount",
    "extra",
    "mta_tax",
    "tip_amount",
    "tolls_amount",
    "improvement_surcharge",
    "total_amount",
    "congestion_surcharge",
    "payment_type",
];

const GREEN_EXTRA_COLUMN_NAMES: &[&str] = &["ehail_fee", "trip_type"];

fn column_names(kind: TaxiKind) -> Vec<&'static str> {
    let mut names = CORE_COLUMN_NAMES.to_vec();
    if kind == TaxiKind::Green {
        names.extend_from_slice(GREEN_EXTRA_COLUMN_NAMES);
    }
    names
}

fn create_table_sql(kind: TaxiKind) -> String {
    let table = target_table(kind);
    match kind {
        TaxiKind::Yellow => format!("CREATE TABLE IF NOT EXISTS {table} ({CORE_COLUMNS_DDL}\n)"),
        TaxiKind::Green => {
            format!("CREATE TABLE IF NOT EXISTS {table} ({CORE_COLUMNS_DDL}{GREEN_EXTRA_DDL}\n)")
        }
    }
}

/// `col = EXCLUDED.col` for every column except the key. A conflicting row
/// is replaced with the incoming values, never left half-old.
fn update_assignments(kind: TaxiKind) -> String {
    column_names(kind)
        .iter()
        .filter(|&&name| name != "row_id")
        .map(|name| format!("{name} = EXCLUDED.{name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Postgres implementation
// =============================================================================

pub struct PgTripStore {
    pool: PgPool,
}

impl PgTripStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TripStore for PgTripStore {
    async fn ensure_table(&self, kind: TaxiKind) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(kind))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("create {}: {e}", target_table(kind))))?;
        Ok(())
    }

    async fn upsert_chunk(
        &self,
        kind: TaxiKind,
        source_file: &str,
        rows: &[KeyedRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            target_table(kind),
            column_names(kind).join(", "),
        ));

        builder.push_values(rows, |mut b, keyed| {
            let row = &keyed.row;
            b.push_bind(keyed.identity.as_str())
                .push_bind(source_file)
                .push_bind(row.vendor_id.as_deref())
                .push_bind(row.pickup_at)
                .push_bind(row.dropoff_at)
                .push_bind(row.store_and_fwd_flag.as_deref())
                .push_bind(row.ratecode_id.as_deref())
                .push_bind(row.pu_location_id.as_deref())
                .push_bind(row.do_location_id.as_deref())
                .push_bind(row.passenger_count)
                .push_bind(row.trip_distance)
                .push_bind(row.fare_amount)
                .push_bind(row.extra)
                .push_bind(row.mta_tax)
                .push_bind(row.tip_amount)
                .push_bind(row.tolls_amount)
                .push_bind(row.improvement_surcharge)
                .push_bind(row.total_amount)
                .push_bind(row.congestion_surcharge)
                .push_bind(row.payment_type);
            if kind == TaxiKind::Green {
                b.push_bind(row.kind_fields.ehail_fee())
                    .push_bind(row.kind_fields.trip_type());
            }
        });

        builder.push(" ON CONFLICT (row_id) DO UPDATE SET ");
        builder.push(update_assignments(kind));

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("upsert into {}: {e}", target_table(kind))))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
