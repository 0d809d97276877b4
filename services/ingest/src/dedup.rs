//! In-batch deduplication: at most one row per identity, first occurrence
//! in source order wins.

use std::collections::HashSet;

use crate::identity::{KeyedRow, RowIdentity};

#[derive(Debug)]
pub struct DedupOutcome {
    pub rows: Vec<KeyedRow>,
    pub duplicates: u64,
}

/// Drops later duplicates of each identity. Rows are re-sorted by source
/// ordinal first, so the tie-break stays stable even if an upstream stage
/// handed them over out of order.
pub fn dedupe(mut rows: Vec<KeyedRow>) -> DedupOutcome {
    rows.sort_by_key(|row| row.ordinal);

    let mut seen: HashSet<RowIdentity> = HashSet::with_capacity(rows.len());
    let mut kept = Vec::with_capacity(rows.len());
    let mut duplicates = 0u64;

    for row in rows {
        if seen.insert(row.identity.clone()) {
            kept.push(row);
        } else {
            duplicates += 1;
        }
    }

    DedupOutcome {
        rows: kept,
        duplicates,
    }
}

// =============================================================================
// Tests
// =============================================================================
