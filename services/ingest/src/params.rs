//! Run parameters: which dataset partition a single execution covers.

use std::fmt;
use std::ops::RangeInclusive;

use clap::ValueEnum;

use crate::error::IngestError;

/// Dataset kind. Each kind has its own source schema and its own target
/// table, but the pipeline between them is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum TaxiKind {
    Yellow,
    Green,
}

impl TaxiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Green => "green",
        }
    }
}

impl fmt::Display for TaxiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated selection of one monthly partition.
///
/// Construction is the only way to get a value, so any `RunParams` in
/// circulation already passed validation: month in 1-12, year inside the
/// supported range it was checked against. Everything downstream (the URL,
/// the staged file name, the lease label) derives from these three fields,
/// never from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    kind: TaxiKind,
    year: i32,
    month: u32,
}

impl RunParams {
    pub fn new(
        kind: TaxiKind,
        year: i32,
        month: u32,
        supported_years: &RangeInclusive<i32>,
    ) -> Result<Self, IngestError> {
        if !(1..=12).contains(&month) {
            return Err(IngestError::InvalidParameter {
                reason: format!("month must be between 1 and 12, got {month}"),
            });
        }
        if !supported_years.contains(&year) {
            return Err(IngestError::InvalidParameter {
                reason: format!(
                    "year must be between {} and {}, got {year}",
                    supported_years.start(),
                    supported_years.end()
                ),
            });
        }
        Ok(Self { kind, year, month })
    }

    pub fn kind(&self) -> TaxiKind {
        self.kind
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Human-readable partition label, e.g. `yellow-2020-01`. Used for the
    /// partition lease, run records and logs.
    pub fn partition_label(&self) -> String {
        format!("{}-{}-{:02}", self.kind, self.year, self.month)
    }

    /// Stem of the upstream release file, e.g. `yellow_tripdata_2020-01`.
    pub fn file_stem(&self) -> String {
        format!("{}_tripdata_{}-{:02}", self.kind, self.year, self.month)
    }
}

// =============================================================================
// Tests
// =============================================================================
