//! Bounded-concurrency per-record detail enrichment.
//!
//! Detail calls carry no cursor dependency, so each batch fans out at once and
//! the next batch waits for the previous one plus a short delay.

use std::time::Duration;

use futures::future::join_all;
use pagesweep_adapters::DetailFetcher;
use pagesweep_core::{Record, RecordId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub merge_field: String,
    pub cancellation: Option<CancellationToken>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay: Duration::from_millis(100),
            merge_field: "detail".to_string(),
            cancellation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichFailure {
    pub id: RecordId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EnrichmentSummary {
    pub enriched: usize,
    pub skipped: usize,
    pub batches: usize,
    pub failures: Vec<EnrichFailure>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentReport {
    /// Same order as the input; failed or skipped records are left untouched.
    pub records: Vec<Record>,
    pub summary: EnrichmentSummary,
}

pub async fn enrich_details(
    mut records: Vec<Record>,
    fetcher: &dyn DetailFetcher,
    options: &EnrichOptions,
) -> EnrichmentReport {
    let batch_size = options.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    let mut summary = EnrichmentSummary::default();
    let total_batches = records.len().div_ceil(batch_size);

    for (batch_idx, chunk) in records.chunks_mut(batch_size).enumerate() {
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            summary.skipped += chunk.len();
            continue;
        }

        let results = join_all(chunk.iter().map(|record| fetcher.fetch_detail(record))).await;
        summary.batches += 1;

        for (record, result) in chunk.iter_mut().zip(results) {
            match result {
                Ok(detail) => {
                    record.insert_field(options.merge_field.clone(), detail);
                    summary.enriched += 1;
                }
                Err(err) => {
                    warn!(id = %record.id, error = %err, "detail fetch failed");
                    summary.failures.push(EnrichFailure {
                        id: record.id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            batch = batch_idx + 1,
            of = total_batches,
            enriched = summary.enriched,
            failed = summary.failures.len(),
            "detail batch complete"
        );

        let more = batch_idx + 1 < total_batches;
        if more && !options.batch_delay.is_zero() {
            tokio::time::sleep(options.batch_delay).await;
        }
    }

    EnrichmentReport { records, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagesweep_core::FetchError;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Tracks peak in-flight calls; fails ids divisible by `fail_every`.
    #[derive(Default)]
    struct CountingDetail {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<RecordId>>,
        fail_every: Option<i64>,
        cancel_on_first: Option<CancellationToken>,
    }

    #[async_trait]
    impl DetailFetcher for CountingDetail {
        async fn fetch_detail(&self, record: &Record) -> Result<JsonValue, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(record.id.clone());
            if let Some(token) = &self.cancel_on_first {
                token.cancel();
            }
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match (&record.id, self.fail_every) {
                (RecordId::Number(n), Some(every)) if n % every == 0 => {
                    Err(FetchError::HttpStatus { status: 404, url: format!("/detail/{n}") })
                }
                _ => Ok(json!({"for": record.id.to_string()})),
            }
        }
    }

    fn records(n: i64) -> Vec<Record> {
        (1..=n).map(Record::new).collect()
    }

    fn fast(batch_size: usize) -> EnrichOptions {
        EnrichOptions {
            batch_size,
            batch_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn merges_detail_and_keeps_order() {
        let fetcher = CountingDetail::default();
        let report = enrich_details(records(7), &fetcher, &fast(3)).await;

        assert_eq!(report.summary.enriched, 7);
        assert_eq!(report.summary.batches, 3);
        let ids: Vec<_> = report.records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, (1..=7).map(RecordId::Number).collect::<Vec<_>>());
        assert_eq!(report.records[4].field("detail"), Some(&json!({"for": "5"})));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_batch_size() {
        let fetcher = CountingDetail::default();
        enrich_details(records(20), &fetcher, &fast(4)).await;
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(fetcher.calls.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn batch_size_is_clamped() {
        let fetcher = CountingDetail::default();
        let report = enrich_details(records(30), &fetcher, &fast(100)).await;
        assert_eq!(report.summary.batches, 2);

        let fetcher = CountingDetail::default();
        let report = enrich_details(records(3), &fetcher, &fast(0)).await;
        assert_eq!(report.summary.batches, 3);
    }

    #[tokio::test]
    async fn failures_are_collected_not_fatal() {
        let fetcher = CountingDetail {
            fail_every: Some(3),
            ..Default::default()
        };
        let report = enrich_details(records(6), &fetcher, &fast(5)).await;

        assert_eq!(report.summary.enriched, 4);
        let failed: Vec<_> = report.summary.failures.iter().map(|f| f.id.clone()).collect();
        assert_eq!(failed, vec![RecordId::Number(3), RecordId::Number(6)]);
        assert!(report.records[2].field("detail").is_none());
        assert_eq!(report.records.len(), 6);
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_batches() {
        let token = CancellationToken::new();
        let fetcher = CountingDetail {
            cancel_on_first: Some(token.clone()),
            ..Default::default()
        };
        let options = EnrichOptions {
            cancellation: Some(token),
            ..fast(2)
        };
        let report = enrich_details(records(6), &fetcher, &options).await;
        assert_eq!(report.summary.enriched, 2);
        assert_eq!(report.summary.skipped, 4);
        assert_eq!(report.records.len(), 6);
    }

    #[tokio::test]
    async fn custom_merge_field() {
        let fetcher = CountingDetail::default();
        let options = EnrichOptions {
            merge_field: "questionnaire".into(),
            ..fast(5)
        };
        let report = enrich_details(records(1), &fetcher, &options).await;
        assert!(report.records[0].field("questionnaire").is_some());
        assert!(report.records[0].field("detail").is_none());
    }
}
