//! Deterministic row identity, the fingerprint that makes re-ingestion
//! idempotent.
//!
//! The hash input is a canonical rendering of the row's stable key fields
//! and nothing else: no randomness, no clock, no memory addresses. Equal key
//! fields always hash to the same identity, across runs and across machines,
//! so re-loading the same partition rewrites rows in place instead of
//! inserting copies.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::normalize::{CanonicalRow, TIMESTAMP_FORMAT};

/// Hex-encoded SHA-256 of a row's canonical key. Distinct source rows with
/// identical key tuples intentionally collapse to one identity; for this
/// dataset the key fields are the practical uniqueness signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowIdentity(String);

impl RowIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A canonical row paired with its source ordinal and identity, as consumed
/// by the deduplicator and the loader.
#[derive(Debug, Clone)]
pub struct KeyedRow {
    pub ordinal: u64,
    pub identity: RowIdentity,
    pub row: CanonicalRow,
}

impl KeyedRow {
    pub fn new(ordinal: u64, row: CanonicalRow) -> Self {
        let identity = row_identity(&row);
        Self {
            ordinal,
            identity,
            row,
        }
    }
}

pub fn row_identity(row: &CanonicalRow) -> RowIdentity {
    let mut hasher = Sha256::new();
    hasher.update(canonical_key(row).as_bytes());
    RowIdentity(format!("{:x}", hasher.finalize()))
}

/// Key fields in hash order: vendor, pickup, dropoff, pickup location,
/// dropoff location, fare, distance. Absent fields render empty; `|`
/// separates fields so adjacent values cannot run together.
fn canonical_key(row: &CanonicalRow) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        row.vendor_id.as_deref().unwrap_or(""),
        row.pickup_at.format(TIMESTAMP_FORMAT),
        row.dropoff_at.format(TIMESTAMP_FORMAT),
        row.pu_location_id.as_deref().unwrap_or(""),
        row.do_location_id.as_deref().unwrap_or(""),
        render_amount(row.fare_amount),
        render_amount(row.trip_distance),
    )
}

fn render_amount(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
