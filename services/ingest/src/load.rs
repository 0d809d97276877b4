//! Chunked loader: bounded-size atomic upserts with stop-after-failure.
//!
//! Chunks go to the store one at a time, in batch order. A failed chunk
//! stops the loader; chunks already committed stay committed, so a rerun of
//! the same partition converges instead of double-loading. Cancellation
//! takes effect between chunks, never inside one.

use std::ops::Range;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::identity::KeyedRow;
use crate::params::TaxiKind;
use crate::store::TripStore;

/// Hard ceiling on chunk size: the widest target table binds 22 values per
/// row and Postgres caps a statement at 65535 bind parameters.
pub const MAX_CHUNK_SIZE: usize = 2500;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// One failed chunk: 1-based chunk index plus the 1-based inclusive row
/// offsets it covered within the deduplicated batch.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk_index: u32,
    pub offset_start: u64,
    pub offset_end: u64,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub chunks_planned: u32,
    pub chunks_committed: u32,
    pub rows_loaded: u64,
    pub failures: Vec<ChunkFailure>,
    /// 1-based index of the first chunk not submitted because cancellation
    /// was requested, when that happened.
    pub cancelled_before: Option<u32>,
}

/// Split `total` rows into contiguous ranges of at most `chunk_size`.
pub fn chunk_ranges(total: usize, chunk_size: usize) -> Vec<Range<usize>> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut ranges = Vec::with_capacity(total.div_ceil(chunk_size));
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

pub async fn load_batch<S>(
    store: &S,
    kind: TaxiKind,
    source_file: &str,
    rows: &[KeyedRow],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> LoadReport
where
    S: TripStore + ?Sized,
{
    let ranges = chunk_ranges(rows.len(), chunk_size);
    let mut report = LoadReport {
        chunks_planned: ranges.len() as u32,
        ..LoadReport::default()
    };

    for (index, range) in ranges.into_iter().enumerate() {
        let chunk_index = index as u32 + 1;
        let offset_start = range.start as u64 + 1;
        let offset_end = range.end as u64;

        if cancel.is_cancelled() {
            warn!(chunk_index, "cancellation requested, stopping before next chunk");
            report.cancelled_before = Some(chunk_index);
            break;
        }

        match store.upsert_chunk(kind, source_file, &rows[range]).await {
            Ok(()) => {
                let chunk_rows = offset_end - offset_start + 1;
                report.chunks_committed += 1;
                report.rows_loaded += chunk_rows;
                info!(
                    chunk_index,
                    chunk_rows,
                    rows_loaded = report.rows_loaded,
                    "chunk committed"
                );
            }
            Err(error) => {
                warn!(
                    chunk_index,
                    offset_start,
                    offset_end,
                    error = %error,
                    "chunk failed, no further chunks will be submitted"
                );
                report.failures.push(ChunkFailure {
                    chunk_index,
                    offset_start,
                    offset_end,
                    reason: error.to_string(),
                });
                break;
            }
        }
    }

    report
}

// =============================================================================
// Tests
// =============================================================================
