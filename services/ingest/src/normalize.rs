//! Row normalizer: raw CSV records into typed canonical rows.
//!
//! One column mapping per dataset kind (yellow carries `tpep_*` timestamps,
//! green carries `lpep_*` and two extra fields). A row that cannot be
//! normalized is skipped and counted by reason; bad rows never abort the
//! run. Only a structurally unusable file (missing timestamp columns,
//! unreadable header) is a hard error.

use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::error::IngestError;
use crate::params::TaxiKind;

/// Timestamp layout used by the source files. The identity hash renders
/// timestamps with the same layout, so the canonical form survives a parse
/// and re-format round trip unchanged.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// =============================================================================
// Canonical row model
// =============================================================================

/// A trip row after normalization. Timestamps are the only required fields;
/// everything else is genuinely absent in parts of the source data and stays
/// optional here.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    pub vendor_id: Option<String>,
    pub pickup_at: NaiveDateTime,
    pub dropoff_at: NaiveDateTime,
    pub store_and_fwd_flag: Option<String>,
    pub ratecode_id: Option<String>,
    pub pu_location_id: Option<String>,
    pub do_location_id: Option<String>,
    pub passenger_count: Option<i64>,
    pub trip_distance: Option<f64>,
    pub fare_amount: Option<f64>,
    pub extra: Option<f64>,
    pub mta_tax: Option<f64>,
    pub tip_amount: Option<f64>,
    pub tolls_amount: Option<f64>,
    pub improvement_surcharge: Option<f64>,
    pub total_amount: Option<f64>,
    pub congestion_surcharge: Option<f64>,
    pub payment_type: Option<i64>,
    pub kind_fields: KindFields,
}

/// Kind-specific tail of the schema, tagged by dataset kind.
#[derive(Debug, Clone, PartialEq)]
pub enum KindFields {
    Yellow,
    Green {
        ehail_fee: Option<f64>,
        trip_type: Option<i64>,
    },
}

impl KindFields {
    pub fn ehail_fee(&self) -> Option<f64> {
        match self {
            Self::Green { ehail_fee, .. } => *ehail_fee,
            Self::Yellow => None,
        }
    }

    pub fn trip_type(&self) -> Option<i64> {
        match self {
            Self::Green { trip_type, .. } => *trip_type,
            Self::Yellow => None,
        }
    }
}

/// A normalized row with its 1-based position among the file's data rows.
/// The ordinal is the dedup tie-breaker and the basis for load offsets.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub ordinal: u64,
    pub row: CanonicalRow,
}

// =============================================================================
// Skip accounting
// =============================================================================

/// Why a source row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The CSV reader could not produce the record at all.
    Unreadable,
    MissingField(&'static str),
    BadTimestamp(&'static str),
    BadNumber(&'static str),
    BadCategory(&'static str),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unreadable => "unreadable",
            Self::MissingField(_) => "missing_field",
            Self::BadTimestamp(_) => "bad_timestamp",
            Self::BadNumber(_) => "bad_number",
            Self::BadCategory(_) => "bad_category",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            Self::Unreadable => "",
            Self::MissingField(name)
            | Self::BadTimestamp(name)
            | Self::BadNumber(name)
            | Self::BadCategory(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RowSkip {
    pub ordinal: u64,
    pub reason: SkipReason,
}

// =============================================================================
// Header resolution
// =============================================================================

/// Resolved header positions for one file. Only the timestamp columns are
/// mandatory: older vintages of the source files genuinely lack later
/// columns (congestion_surcharge appears in 2019), and those fields simply
/// normalize to None.
#[derive(Debug)]
struct ColumnMap {
    vendor_id: Option<usize>,
    pickup_at: usize,
    dropoff_at: usize,
    store_and_fwd_flag: Option<usize>,
    ratecode_id: Option<usize>,
    pu_location_id: Option<usize>,
    do_location_id: Option<usize>,
    passenger_count: Option<usize>,
    trip_distance: Option<usize>,
    fare_amount: Option<usize>,
    extra: Option<usize>,
    mta_tax: Option<usize>,
    tip_amount: Option<usize>,
    tolls_amount: Option<usize>,
    improvement_surcharge: Option<usize>,
    total_amount: Option<usize>,
    congestion_surcharge: Option<usize>,
    payment_type: Option<usize>,
    ehail_fee: Option<usize>,
    trip_type: Option<usize>,
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}

fn resolve_columns(kind: TaxiKind, headers: &csv::StringRecord) -> Result<ColumnMap, IngestError> {
    let (pickup_name, dropoff_name) = match kind {
        TaxiKind::Yellow => ("tpep_pickup_datetime", "tpep_dropoff_datetime"),
        TaxiKind::Green => ("lpep_pickup_datetime", "lpep_dropoff_datetime"),
    };

    let pickup_at = find_column(headers, pickup_name).ok_or_else(|| {
        IngestError::SourceSchema(format!("missing required column {pickup_name}"))
    })?;
    let dropoff_at = find_column(headers, dropoff_name).ok_or_else(|| {
        IngestError::SourceSchema(format!("missing required column {dropoff_name}"))
    })?;

    let (ehail_fee, trip_type) = match kind {
        TaxiKind::Yellow => (None, None),
        TaxiKind::Green => (
            find_column(headers, "ehail_fee"),
            find_column(headers, "trip_type"),
        ),
    };

    Ok(ColumnMap {
        vendor_id: find_column(headers, "vendorid"),
        pickup_at,
        dropoff_at,
        store_and_fwd_flag: find_column(headers, "store_and_fwd_flag"),
        ratecode_id: find_column(headers, "ratecodeid"),
        pu_location_id: find_column(headers, "pulocationid"),
        do_location_id: find_column(headers, "dolocationid"),
        passenger_count: find_column(headers, "passenger_count"),
        trip_distance: find_column(headers, "trip_distance"),
        fare_amount: find_column(headers, "fare_amount"),
        extra: find_column(headers, "extra"),
        mta_tax: find_column(headers, "mta_tax"),
        tip_amount: find_column(headers, "tip_amount"),
        tolls_amount: find_column(headers, "tolls_amount"),
        improvement_surcharge: find_column(headers, "improvement_surcharge"),
        total_amount: find_column(headers, "total_amount"),
        congestion_surcharge: find_column(headers, "congestion_surcharge"),
        payment_type: find_column(headers, "payment_type"),
        ehail_fee,
        trip_type,
    })
}

// =============================================================================
// Field parsing
// =============================================================================

/// Trimmed, non-empty text at a mapped column. Empty cells and unmapped
/// columns both read as absent.
fn field<'r>(record: &'r csv::StringRecord, column: Option<usize>) -> Option<&'r str> {
    let index = column?;
    match record.get(index).map(str::trim) {
        Some("") | None => None,
        Some(value) => Some(value),
    }
}

fn required_timestamp(
    record: &csv::StringRecord,
    column: usize,
    name: &'static str,
) -> Result<NaiveDateTime, SkipReason> {
    let raw = field(record, Some(column)).ok_or(SkipReason::MissingField(name))?;
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| SkipReason::BadTimestamp(name))
}

fn optional_f64(
    record: &csv::StringRecord,
    column: Option<usize>,
    name: &'static str,
) -> Result<Option<f64>, SkipReason> {
    match field(record, column) {
        None => Ok(None),
        Some(raw) => {
            let value: f64 = raw.parse().map_err(|_| SkipReason::BadNumber(name))?;
            if value.is_finite() {
                Ok(Some(value))
            } else {
                Err(SkipReason::BadNumber(name))
            }
        }
    }
}

/// Integer fields arrive as "1", "1.0" or empty depending on the file
/// vintage; the float spelling is accepted when it is exactly integral.
fn optional_i64(
    record: &csv::StringRecord,
    column: Option<usize>,
    name: &'static str,
) -> Result<Option<i64>, SkipReason> {
    match field(record, column) {
        None => Ok(None),
        Some(raw) => {
            if let Ok(value) = raw.parse::<i64>() {
                return Ok(Some(value));
            }
            let value: f64 = raw.parse().map_err(|_| SkipReason::BadNumber(name))?;
            if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                Ok(Some(value as i64))
            } else {
                Err(SkipReason::BadNumber(name))
            }
        }
    }
}

fn bounded_i64(
    record: &csv::StringRecord,
    column: Option<usize>,
    name: &'static str,
    max: i64,
) -> Result<Option<i64>, SkipReason> {
    match optional_i64(record, column, name)? {
        Some(value) if !(1..=max).contains(&value) => Err(SkipReason::BadCategory(name)),
        other => Ok(other),
    }
}

fn store_and_fwd(
    record: &csv::StringRecord,
    column: Option<usize>,
) -> Result<Option<String>, SkipReason> {
    match field(record, column) {
        None => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case("y") => Ok(Some("Y".to_string())),
        Some(raw) if raw.eq_ignore_ascii_case("n") => Ok(Some("N".to_string())),
        Some(_) => Err(SkipReason::BadCategory("store_and_fwd_flag")),
    }
}

fn optional_text(record: &csv::StringRecord, column: Option<usize>) -> Option<String> {
    field(record, column).map(str::to_string)
}

fn normalize_record(
    kind: TaxiKind,
    columns: &ColumnMap,
    record: &csv::StringRecord,
) -> Result<CanonicalRow, SkipReason> {
    let pickup_at = required_timestamp(record, columns.pickup_at, "pickup_datetime")?;
    let dropoff_at = required_timestamp(record, columns.dropoff_at, "dropoff_datetime")?;

    let kind_fields = match kind {
        TaxiKind::Yellow => KindFields::Yellow,
        TaxiKind::Green => KindFields::Green {
            ehail_fee: optional_f64(record, columns.ehail_fee, "ehail_fee")?,
            trip_type: bounded_i64(record, columns.trip_type, "trip_type", 2)?,
        },
    };

    Ok(CanonicalRow {
        vendor_id: optional_text(record, columns.vendor_id),
        pickup_at,
        dropoff_at,
        store_and_fwd_flag: store_and_fwd(record, columns.store_and_fwd_flag)?,
        // RatecodeID stays free text: real files carry the out-of-dictionary
        // sentinel 99, which is data, not corruption.
        ratecode_id: optional_text(record, columns.ratecode_id),
        pu_location_id: optional_text(record, columns.pu_location_id),
        do_location_id: optional_text(record, columns.do_location_id),
        passenger_count: optional_i64(record, columns.passenger_count, "passenger_count")?,
        trip_distance: optional_f64(record, columns.trip_distance, "trip_distance")?,
        fare_amount: optional_f64(record, columns.fare_amount, "fare_amount")?,
        extra: optional_f64(record, columns.extra, "extra")?,
        mta_tax: optional_f64(record, columns.mta_tax, "mta_tax")?,
        tip_amount: optional_f64(record, columns.tip_amount, "tip_amount")?,
        tolls_amount: optional_f64(record, columns.tolls_amount, "tolls_amount")?,
        improvement_surcharge: optional_f64(
            record,
            columns.improvement_surcharge,
            "improvement_surcharge",
        )?,
        total_amount: optional_f64(record, columns.total_amount, "total_amount")?,
        congestion_surcharge: optional_f64(
            record,
            columns.congestion_surcharge,
            "congestion_surcharge",
        )?,
        payment_type: bounded_i64(record, columns.payment_type, "payment_type", 6)?,
        kind_fields,
    })
}

// =============================================================================
// Single-pass reader
// =============================================================================

/// Lazy forward pass over one staged file: each data row comes out exactly
/// once, as either a normalized row or a counted skip. Not restartable.
pub struct RowReader<R: Read> {
    records: csv::StringRecordsIntoIter<R>,
    columns: ColumnMap,
    kind: TaxiKind,
    ordinal: u64,
}

impl<R: Read> RowReader<R> {
    pub fn new(kind: TaxiKind, input: R) -> Result<Self, IngestError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(input);
        let headers = reader
            .headers()
            .map_err(|e| IngestError::SourceSchema(format!("unreadable header: {e}")))?
            .clone();
        let columns = resolve_columns(kind, &headers)?;
        Ok(Self {
            records: reader.into_records(),
            columns,
            kind,
            ordinal: 0,
        })
    }
}

impl<R: Read> Iterator for RowReader<R> {
    type Item = Result<SourceRow, RowSkip>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        self.ordinal += 1;
        let ordinal = self.ordinal;
        let item = match record {
            Ok(record) => normalize_record(self.kind, &self.columns, &record)
                .map(|row| SourceRow { ordinal, row })
                .map_err(|reason| RowSkip { ordinal, reason }),
            Err(_) => Err(RowSkip {
                ordinal,
                reason: SkipReason::Unreadable,
            }),
        };
        Some(item)
    }
}

// =============================================================================
// Batch normalization
// =============================================================================

#[derive(Debug)]
pub struct NormalizeOutcome {
    pub rows: Vec<SourceRow>,
    /// Data rows seen by the reader, good and bad alike.
    pub raw_rows: u64,
    pub skipped: u64,
    pub skipped_by_reason: BTreeMap<&'static str, u64>,
}

pub fn normalize_reader<R: Read>(
    kind: TaxiKind,
    input: R,
) -> Result<NormalizeOutcome, IngestError> {
    let reader = RowReader::new(kind, input)?;
    let mut rows = Vec::new();
    let mut raw_rows = 0u64;
    let mut skipped = 0u64;
    let mut skipped_by_reason: BTreeMap<&'static str, u64> = BTreeMap::new();

    for item in reader {
        raw_rows += 1;
        match item {
            Ok(row) => rows.push(row),
            Err(skip) => {
                skipped += 1;
                *skipped_by_reason.entry(skip.reason.label()).or_insert(0) += 1;
                debug!(
                    ordinal = skip.ordinal,
                    reason = skip.reason.label(),
                    field = skip.reason.field(),
                    "skipping row"
                );
            }
        }
    }

    Ok(NormalizeOutcome {
        rows,
        raw_rows,
        skipped,
        skipped_by_reason,
    })
}

/// Normalize the staged CSV for one partition.
pub fn normalize_staged(kind: TaxiKind, path: &Path) -> Result<NormalizeOutcome, IngestError> {
    let file = std::fs::File::open(path).map_err(|source| IngestError::Staging {
        path: path.to_path_buf(),
        source,
    })?;
    normalize_reader(kind, BufReader::new(file))
}

// =============================================================================
// Tests
// =============================================================================
