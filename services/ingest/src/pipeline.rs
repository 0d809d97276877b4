//! The straight-line ingestion pipeline: fetch, normalize, identify,
//! deduplicate, load.
//!
//! Stages run in a fixed order and each consumes the previous stage's
//! output, so a failure carries the counts of everything that already
//! happened. The same parameters always walk the same path; running a
//! partition twice converges on the same warehouse state.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dedup;
use crate::error::IngestError;
use crate::fetch::SourceFetcher;
use crate::identity::KeyedRow;
use crate::load;
use crate::normalize::{self, NormalizeOutcome};
use crate::params::RunParams;
use crate::store::TripStore;

/// Per-run knobs beyond the partition selection itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub chunk_size: usize,
    /// Fetch and normalize only; no warehouse writes.
    pub dry_run: bool,
    /// Keep the staged CSV after a successful run.
    pub keep_staging: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_size: load::DEFAULT_CHUNK_SIZE,
            dry_run: false,
            keep_staging: false,
        }
    }
}

/// Counts for one run, filled in as stages complete. A failed run still
/// reports the progress it made before stopping.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub source_file: Option<String>,
    pub rows_fetched: u64,
    pub rows_normalized: u64,
    pub rows_skipped: u64,
    pub skipped_by_reason: BTreeMap<&'static str, u64>,
    pub duplicates_dropped: u64,
    pub rows_loaded: u64,
    pub chunks_planned: u32,
    pub chunks_committed: u32,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub error: Option<IngestError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(report: RunReport, error: IngestError) -> Self {
        Self {
            report,
            error: Some(error),
        }
    }
}

pub async fn run<F, S>(
    fetcher: &F,
    store: &S,
    params: &RunParams,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> RunOutcome
where
    F: SourceFetcher + ?Sized,
    S: TripStore + ?Sized,
{
    let mut report = RunReport::default();
    info!(partition = %params.partition_label(), "starting ingest run");

    // ---- Fetch and stage ----
    let staged = match fetcher.fetch(params).await {
        Ok(staged) => staged,
        Err(error) => return RunOutcome::failed(report, error),
    };
    report.source_file = Some(staged.source_file.clone());
    report.rows_fetched = staged.raw_rows;

    // ---- Normalize ----
    let normalized = match normalize::normalize_staged(params.kind(), &staged.path) {
        Ok(outcome) => outcome,
        Err(error) => return RunOutcome::failed(report, error),
    };
    let NormalizeOutcome {
        rows,
        raw_rows,
        skipped,
        skipped_by_reason,
    } = normalized;
    if raw_rows != report.rows_fetched {
        warn!(
            counted_at_fetch = report.rows_fetched,
            counted_at_parse = raw_rows,
            "raw row count drifted between staging and parsing"
        );
        report.rows_fetched = raw_rows;
    }
    report.rows_normalized = rows.len() as u64;
    report.rows_skipped = skipped;
    report.skipped_by_reason = skipped_by_reason;
    if skipped > 0 {
        warn!(skipped, "rows dropped during normalization");
    }

    // ---- Identity and dedup ----
    let keyed: Vec<KeyedRow> = rows
        .into_iter()
        .map(|source| KeyedRow::new(source.ordinal, source.row))
        .collect();
    let deduped = dedup::dedupe(keyed);
    report.duplicates_dropped = deduped.duplicates;
    if deduped.duplicates > 0 {
        info!(
            duplicates = deduped.duplicates,
            "dropped in-batch duplicate identities"
        );
    }

    if options.dry_run {
        info!("dry run, skipping warehouse writes");
        cleanup_staging(&staged.path, options.keep_staging).await;
        return RunOutcome {
            report,
            error: None,
        };
    }

    // ---- Load ----
    if let Err(error) = store.ensure_table(params.kind()).await {
        return RunOutcome::failed(report, IngestError::from(error));
    }

    let load_report = load::load_batch(
        store,
        params.kind(),
        &staged.source_file,
        &deduped.rows,
        options.chunk_size,
        cancel,
    )
    .await;
    report.chunks_planned = load_report.chunks_planned;
    report.chunks_committed = load_report.chunks_committed;
    report.rows_loaded = load_report.rows_loaded;

    let error = if let Some(failure) = load_report.failures.first() {
        Some(IngestError::Load {
            chunk_index: failure.chunk_index,
            offset_start: failure.offset_start,
            offset_end: failure.offset_end,
            reason: failure.reason.clone(),
        })
    } else if let Some(chunk_index) = load_report.cancelled_before {
        // Offsets of the chunk that was about to run when the request landed.
        let offset_start = (chunk_index as u64 - 1) * options.chunk_size as u64 + 1;
        let offset_end =
            (offset_start + options.chunk_size as u64 - 1).min(deduped.rows.len() as u64);
        Some(IngestError::Cancelled {
            chunk_index,
            offset_start,
            offset_end,
        })
    } else {
        None
    };

    // A successful run removes its staged download; a failed run keeps the
    // file around for inspection and rerun.
    if error.is_none() {
        cleanup_staging(&staged.path, options.keep_staging).await;
        info!(
            rows_loaded = report.rows_loaded,
            chunks = report.chunks_committed,
            "ingest run complete"
        );
    }

    RunOutcome { report, error }
}

async fn cleanup_staging(path: &Path, keep: bool) {
    if keep {
        return;
    }
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), %error, "failed to remove staged file");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::fetch::{count_data_rows, StagedPartition};
    use crate::normalize::TIMESTAMP_FORMAT;
    use crate::params::TaxiKind;
    use crate::testutil::FixtureStore;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    const YELLOW_HEADER: &str = "VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,RatecodeID,store_and_fwd_flag,PULocationID,DOLocationID,payment_type,fare_amount,extra,mta_tax,tip_amount,tolls_amount,improvement_surcharge,total_amount,congestion_surcharge";

    fn yellow_line(seed: usize, with_dropoff: bool) -> String {
        let pickup = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(seed as i64);
        let dropoff = if with_dropoff {
            (pickup + chrono::Duration::minutes(9))
                .format(TIMESTAMP_FORMAT)
                .to_string()
        } else {
            String::new()
        };
        format!(
            "1,{},{},1,1.5,1,N,238,239,1,7.0,0.5,0.5,1.2,0.0,0.3,11.0,2.5\n",
            pickup.format(TIMESTAMP_FORMAT),
            dropoff
        )
    }

    /// `unique` distinct rows, then `duplicates` copies of the first row,
    /// then `missing` rows without a dropoff timestamp.
    fn scenario_csv(unique: usize, duplicates: usize, missing: usize) -> String {
        let mut out = String::from(YELLOW_HEADER);
        out.push('\n');
        for seed in 0..unique {
            out.push_str(&yellow_line(seed, true));
        }
        for _ in 0..duplicates {
            out.push_str(&yellow_line(0, true));
        }
        for seed in 0..missing {
            out.push_str(&yellow_line(unique + seed, false));
        }
        out
    }

    /// Stages a fixed CSV from a temp dir instead of the network.
    struct FakeFetcher {
        dir: tempfile::TempDir,
        csv: String,
        calls: AtomicU32,
    }

    impl FakeFetcher {
        fn new(csv: String) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                csv,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn staged_path(&self, name: &str) -> std::path::PathBuf {
            self.dir.path().join(name)
        }
    }

    #[async_trait]
    impl crate::fetch::SourceFetcher for FakeFetcher {
        async fn fetch(&self, params: &RunParams) -> Result<StagedPartition, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let source_file = format!("{}.csv", params.file_stem());
            let path = self.dir.path().join(&source_file);
            std::fs::write(&path, &self.csv).map_err(|source| IngestError::Staging {
                path: path.clone(),
                source,
            })?;
            Ok(StagedPartition {
                path,
                source_file,
                raw_rows: count_data_rows(self.csv.as_bytes()),
            })
        }
    }

    fn params() -> RunParams {
        RunParams::new(TaxiKind::Yellow, 2020, 1, &(2009..=2025)).unwrap()
    }

    fn options(chunk_size: usize) -> RunOptions {
        RunOptions {
            chunk_size,
            ..RunOptions::default()
        }
    }

    // -------------------------------------------------------------------------
    // END-TO-END COUNTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn skips_dedupes_and_loads_with_exact_counts() {
        // 1000 raw rows: 985 unique, 10 duplicates of the first key tuple,
        // 5 with a missing dropoff timestamp.
        let fetcher = FakeFetcher::new(scenario_csv(985, 10, 5));
        let store = FixtureStore::new();
        let cancel = CancellationToken::new();

        let outcome = run(&fetcher, &store, &params(), &options(200), &cancel).await;

        assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
        let report = &outcome.report;
        assert_eq!(report.rows_fetched, 1000);
        assert_eq!(report.rows_skipped, 5);
        assert_eq!(report.skipped_by_reason.get("missing_field"), Some(&5));
        assert_eq!(report.rows_normalized, 995);
        assert_eq!(report.duplicates_dropped, 10);
        assert_eq!(report.rows_loaded, 985);
        assert_eq!(report.chunks_planned, 5);
        assert_eq!(report.chunks_committed, 5);

        assert_eq!(store.row_count(), 985);
        assert!(store.all_rows_from("yellow_tripdata_2020-01.csv"));
    }

    #[tokio::test]
    async fn rerunning_the_same_partition_converges() {
        let fetcher = FakeFetcher::new(scenario_csv(50, 0, 0));
        let store = FixtureStore::new();
        let cancel = CancellationToken::new();

        let first = run(&fetcher, &store, &params(), &options(20), &cancel).await;
        let second = run(&fetcher, &store, &params(), &options(20), &cancel).await;

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(first.report.rows_loaded, 50);
        assert_eq!(second.report.rows_loaded, 50);
        // The second pass rewrote rows in place instead of adding copies.
        assert_eq!(store.row_count(), 50);
    }

    // -------------------------------------------------------------------------
    // FAILURE AND CANCELLATION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn chunk_failure_surfaces_offsets_and_keeps_progress() {
        let fetcher = FakeFetcher::new(scenario_csv(250, 0, 0));
        let store = FixtureStore::failing_on(2);
        let cancel = CancellationToken::new();

        let outcome = run(&fetcher, &store, &params(), &options(100), &cancel).await;

        match outcome.error {
            Some(IngestError::Load {
                chunk_index,
                offset_start,
                offset_end,
                ..
            }) => {
                assert_eq!(chunk_index, 2);
                assert_eq!(offset_start, 101);
                assert_eq!(offset_end, 200);
            }
            other => panic!("expected a load error, got {other:?}"),
        }

        // Committed work stands and is reported.
        assert_eq!(outcome.report.chunks_committed, 1);
        assert_eq!(outcome.report.rows_loaded, 100);
        assert_eq!(store.row_count(), 100);
        // Chunk 3 was never submitted.
        assert_eq!(store.upsert_calls(), 2);

        // The staged file survives a failed run.
        assert!(fetcher.staged_path("yellow_tripdata_2020-01.csv").exists());
    }

    #[tokio::test]
    async fn cancellation_between_chunks_reports_the_unsubmitted_chunk() {
        let fetcher = FakeFetcher::new(scenario_csv(250, 0, 0));
        let store = FixtureStore::cancelling_after(1);
        let cancel = store.cancel_token();

        let outcome = run(&fetcher, &store, &params(), &options(100), &cancel).await;

        match outcome.error {
            Some(IngestError::Cancelled {
                chunk_index,
                offset_start,
                offset_end,
            }) => {
                assert_eq!(chunk_index, 2);
                assert_eq!(offset_start, 101);
                assert_eq!(offset_end, 200);
            }
            other => panic!("expected a cancellation error, got {other:?}"),
        }
        assert_eq!(outcome.report.chunks_committed, 1);
        assert_eq!(store.row_count(), 100);
    }

    // -------------------------------------------------------------------------
    // MODES AND STAGING LIFECYCLE
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn dry_run_never_touches_the_store() {
        let fetcher = FakeFetcher::new(scenario_csv(30, 2, 1));
        let store = FixtureStore::new();
        let cancel = CancellationToken::new();
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let outcome = run(&fetcher, &store, &params(), &options, &cancel).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.report.rows_normalized, 32);
        assert_eq!(outcome.report.rows_skipped, 1);
        assert_eq!(outcome.report.duplicates_dropped, 2);
        assert_eq!(outcome.report.rows_loaded, 0);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn successful_run_removes_the_staged_file() {
        let fetcher = FakeFetcher::new(scenario_csv(10, 0, 0));
        let store = FixtureStore::new();
        let cancel = CancellationToken::new();

        let outcome = run(&fetcher, &store, &params(), &options(5), &cancel).await;

        assert!(outcome.is_success());
        assert!(!fetcher.staged_path("yellow_tripdata_2020-01.csv").exists());
    }

    #[tokio::test]
    async fn keep_staging_leaves_the_file_in_place() {
        let fetcher = FakeFetcher::new(scenario_csv(10, 0, 0));
        let store = FixtureStore::new();
        let cancel = CancellationToken::new();
        let options = RunOptions {
            chunk_size: 5,
            keep_staging: true,
            ..RunOptions::default()
        };

        let outcome = run(&fetcher, &store, &params(), &options, &cancel).await;

        assert!(outcome.is_success());
        assert!(fetcher.staged_path("yellow_tripdata_2020-01.csv").exists());
    }

    // -------------------------------------------------------------------------
    // PARAMETER ORDERING
    // -------------------------------------------------------------------------

    #[test]
    fn invalid_parameters_fail_before_any_fetch() {
        // run() only accepts already-validated RunParams, so a bad month
        // never reaches the fetcher. The counter proves nothing fired.
        let fetcher = FakeFetcher::new(scenario_csv(1, 0, 0));

        let err = RunParams::new(TaxiKind::Yellow, 2020, 13, &(2009..=2025)).unwrap_err();
        assert!(matches!(err, IngestError::InvalidParameter { .. }));
        assert_eq!(fetcher.calls(), 0);
    }
}
