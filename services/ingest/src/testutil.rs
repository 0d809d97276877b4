//! Shared test doubles: deterministic row batches and an in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::identity::KeyedRow;
use crate::normalize::{CanonicalRow, KindFields};
use crate::params::TaxiKind;
use crate::store::{StoreError, TripStore};

/// Deterministic, pairwise-distinct rows: each seed shifts the pickup time,
/// which is a key field, so identities never collide across seeds.
pub fn sample_row(seed: u32) -> CanonicalRow {
    let pickup = NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
        + chrono::Duration::minutes(seed as i64);
    CanonicalRow {
        vendor_id: Some("1".to_string()),
        pickup_at: pickup,
        dropoff_at: pickup + chrono::Duration::minutes(10),
        store_and_fwd_flag: Some("N".to_string()),
        ratecode_id: Some("1".to_string()),
        pu_location_id: Some("238".to_string()),
        do_location_id: Some("239".to_string()),
        passenger_count: Some(1),
        trip_distance: Some(1.5),
        fare_amount: Some(7.0),
        extra: Some(0.5),
        mta_tax: Some(0.5),
        tip_amount: Some(1.0),
        tolls_amount: Some(0.0),
        improvement_surcharge: Some(0.3),
        total_amount: Some(9.3),
        congestion_surcharge: Some(2.5),
        payment_type: Some(1),
        kind_fields: KindFields::Yellow,
    }
}

pub fn keyed_batch(count: u32) -> Vec<KeyedRow> {
    (0..count)
        .map(|seed| KeyedRow::new(seed as u64 + 1, sample_row(seed)))
        .collect()
}

/// In-memory stand-in for the warehouse. Rows are keyed by identity exactly
/// like the real table, so upserting the same identity twice keeps one row.
pub struct FixtureStore {
    rows: Mutex<HashMap<String, (String, KeyedRow)>>,
    chunk_sizes: Mutex<Vec<usize>>,
    upsert_calls: AtomicU32,
    fail_on_call: Option<u32>,
    cancel_after: Option<u32>,
    cancel: CancellationToken,
}

impl FixtureStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            chunk_sizes: Mutex::new(Vec::new()),
            upsert_calls: AtomicU32::new(0),
            fail_on_call: None,
            cancel_after: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Fails the nth upsert call (1-based) with a query error.
    pub fn failing_on(call: u32) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new()
        }
    }

    /// Cancels its token right after the nth successful upsert, emulating an
    /// operator interrupt that lands while a chunk is in flight.
    pub fn cancelling_after(calls: u32) -> Self {
        Self {
            cancel_after: Some(calls),
            ..Self::new()
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn upsert_calls(&self) -> u32 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_sizes.lock().unwrap().clone()
    }

    pub fn all_rows_from(&self, source_file: &str) -> bool {
        self.rows
            .lock()
            .unwrap()
            .values()
            .all(|(file, _)| file == source_file)
    }

    pub fn stored_tip(&self, identity: &str) -> Option<f64> {
        self.rows
            .lock()
            .unwrap()
            .get(identity)
            .and_then(|(_, keyed)| keyed.row.tip_amount)
    }
}

#[async_trait]
impl TripStore for FixtureStore {
    async fn ensure_table(&self, _kind: TaxiKind) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_chunk(
        &self,
        _kind: TaxiKind,
        source_file: &str,
        rows: &[KeyedRow],
    ) -> Result<(), StoreError> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(StoreError::Query("injected chunk failure".to_string()));
        }

        {
            let mut map = self.rows.lock().unwrap();
            for keyed in rows {
                map.insert(
                    keyed.identity.as_str().to_string(),
                    (source_file.to_string(), keyed.clone()),
                );
            }
        }
        self.chunk_sizes.lock().unwrap().push(rows.len());

        if self.cancel_after == Some(call) {
            self.cancel.cancel();
        }
        Ok(())
    }
}
