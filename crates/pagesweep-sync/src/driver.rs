//! Sequential cursor-walking driver and the per-run session it owns.

use std::time::Duration;

use pagesweep_adapters::PageFetcher;
use pagesweep_core::{Cursor, FetchError, Page, Record, TerminationReason};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::accumulator::DedupAccumulator;

pub const DEFAULT_INTER_PAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    #[default]
    Idle,
    Fetching,
    Accumulating,
    Done(TerminationReason),
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageStats {
    pub request_no: usize,
    pub received: usize,
    pub added: usize,
    pub duplicates: usize,
    pub raw_empty: bool,
}

/// Mutable state for one `run_all` call. Not shared between runs.
#[derive(Debug, Default)]
pub struct FetchSession {
    accumulator: DedupAccumulator,
    total_requests: usize,
    duplicates_found: usize,
    cursor: Option<Cursor>,
    state: SessionState,
    pages: Vec<PageStats>,
}

impl FetchSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Records accumulated so far, including after a failed run.
    pub fn snapshot(&self) -> Vec<Record> {
        self.accumulator.snapshot()
    }

    pub fn total_requests(&self) -> usize {
        self.total_requests
    }

    pub fn duplicates_found(&self) -> usize {
        self.duplicates_found
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn pages(&self) -> &[PageStats] {
        &self.pages
    }

    pub fn unique_records(&self) -> usize {
        self.accumulator.len()
    }

    fn reset(&mut self, initial_cursor: Option<Cursor>) {
        *self = Self {
            cursor: initial_cursor,
            ..Self::default()
        };
    }

    fn finish(&mut self, reason: TerminationReason) -> FetchReport {
        self.state = SessionState::Done(reason);
        FetchReport {
            records: self.accumulator.snapshot(),
            total_requests: self.total_requests,
            duplicates_found: self.duplicates_found,
            termination: reason,
            pages: self.pages.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub records: Vec<Record>,
    pub total_requests: usize,
    pub duplicates_found: usize,
    pub termination: TerminationReason,
    pub pages: Vec<PageStats>,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub inter_page_delay: Duration,
    pub max_pages: Option<usize>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            inter_page_delay: DEFAULT_INTER_PAGE_DELAY,
            max_pages: None,
            cancellation: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaginationDriver {
    options: DriverOptions,
}

impl PaginationDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Run with a throwaway session; partial results are lost on error.
    pub async fn run_fresh(
        &self,
        initial_cursor: Option<Cursor>,
        fetcher: &dyn PageFetcher,
    ) -> Result<FetchReport, FetchError> {
        let mut session = FetchSession::new();
        self.run_all(&mut session, initial_cursor, fetcher).await
    }

    /// Walk pages until exhausted, stuck, cancelled or the page limit is hit.
    ///
    /// The session is reset first. On a fetch error the session is left in
    /// [`SessionState::Failed`] and still holds the partial snapshot.
    pub async fn run_all(
        &self,
        session: &mut FetchSession,
        initial_cursor: Option<Cursor>,
        fetcher: &dyn PageFetcher,
    ) -> Result<FetchReport, FetchError> {
        session.reset(initial_cursor);
        let span = info_span!("fetch_session", initial_cursor = ?session.cursor);
        self.drive(session, fetcher).instrument(span).await
    }

    async fn drive(
        &self,
        session: &mut FetchSession,
        fetcher: &dyn PageFetcher,
    ) -> Result<FetchReport, FetchError> {
        loop {
            if self.is_cancelled() {
                info!(requests = session.total_requests, "cancelled before next fetch");
                return Ok(self.complete(session, TerminationReason::Cancelled));
            }
            if self
                .options
                .max_pages
                .is_some_and(|max| session.total_requests >= max)
            {
                return Ok(self.complete(session, TerminationReason::PageLimit));
            }

            session.state = SessionState::Fetching;
            session.total_requests += 1;
            let request_no = session.total_requests;

            let page = match fetcher.fetch_page(session.cursor.as_ref()).await {
                Ok(page) => page,
                Err(err) => {
                    session.state = SessionState::Failed;
                    warn!(
                        request_no,
                        cursor = ?session.cursor,
                        unique = session.accumulator.len(),
                        error = %err,
                        "page fetch failed"
                    );
                    return Err(err);
                }
            };

            if page.is_exhausted() {
                session.pages.push(PageStats {
                    request_no,
                    received: 0,
                    added: 0,
                    duplicates: 0,
                    raw_empty: page.raw_empty,
                });
                debug!(request_no, raw_empty = page.raw_empty, "empty page");
                return Ok(self.complete(session, TerminationReason::Exhausted));
            }

            session.state = SessionState::Accumulating;
            let Page {
                records,
                last_record_cursor,
                ..
            } = page;
            let received = records.len();
            let tally = session.accumulator.add_page(records);
            session.duplicates_found += tally.duplicates;
            session.pages.push(PageStats {
                request_no,
                received,
                added: tally.added,
                duplicates: tally.duplicates,
                raw_empty: false,
            });
            info!(
                request_no,
                received,
                added = tally.added,
                duplicates = tally.duplicates,
                total = session.accumulator.len(),
                "page accumulated"
            );

            if tally.added == 0 {
                return Ok(self.complete(session, TerminationReason::Stuck));
            }

            let Some(next_cursor) = last_record_cursor else {
                debug!(request_no, "no cursor on last record");
                return Ok(self.complete(session, TerminationReason::Exhausted));
            };

            self.pause().await;
            session.cursor = Some(next_cursor);
        }
    }

    fn complete(&self, session: &mut FetchSession, reason: TerminationReason) -> FetchReport {
        let report = session.finish(reason);
        info!(
            termination = %reason,
            requests = report.total_requests,
            duplicates = report.duplicates_found,
            unique = report.records.len(),
            "fetch session finished"
        );
        report
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    async fn pause(&self) {
        let delay = self.options.inter_page_delay;
        if delay.is_zero() {
            return;
        }
        match &self.options.cancellation {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagesweep_core::RecordId;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Scripted = Result<Page, FetchError>;

    /// Replays a fixed script and records the cursor of every call.
    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Scripted>>,
        repeat: Option<Page>,
        seen_cursors: Mutex<Vec<Option<Cursor>>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn repeating(page: Page) -> Self {
            Self {
                repeat: Some(page),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.seen_cursors.lock().unwrap().len()
        }

        fn cursors(&self) -> Vec<Option<Cursor>> {
            self.seen_cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, FetchError> {
            let calls = {
                let mut seen = self.seen_cursors.lock().unwrap();
                seen.push(cursor.cloned());
                seen.len()
            };
            if let Some((after, token)) = &self.cancel_after {
                if calls >= *after {
                    token.cancel();
                }
            }
            if let Some(page) = &self.repeat {
                return Ok(page.clone());
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::raw_empty()))
        }
    }

    fn page(ids: &[i64], cursor: Option<&str>) -> Scripted {
        Ok(Page::new(
            ids.iter().map(|id| Record::new(*id)).collect(),
            cursor.map(Cursor::from),
        ))
    }

    fn no_delay() -> PaginationDriver {
        PaginationDriver::new(DriverOptions {
            inter_page_delay: Duration::ZERO,
            ..Default::default()
        })
    }

    fn ids(records: &[Record]) -> Vec<RecordId> {
        records.iter().map(|r| r.id.clone()).collect()
    }

    #[tokio::test]
    async fn overlapping_pages_then_empty_page() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&[1, 2], Some("t1")),
            page(&[2, 3], Some("t2")),
            page(&[], None),
        ]);
        let report = no_delay().run_fresh(None, &fetcher).await.expect("run");

        assert_eq!(ids(&report.records), vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.duplicates_found, 1);
        assert_eq!(report.termination, TerminationReason::Exhausted);
        assert_eq!(
            fetcher.cursors(),
            vec![None, Some(Cursor::from("t1")), Some(Cursor::from("t2"))]
        );
    }

    #[tokio::test]
    async fn identical_page_every_call_stops_as_stuck() {
        let fetcher = ScriptedFetcher::repeating(Page::new(vec![Record::new(1)], Some(Cursor::from("t1"))));
        let report = no_delay().run_fresh(None, &fetcher).await.expect("run");

        assert_eq!(report.total_requests, 2);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(ids(&report.records), vec![1.into()]);
        assert_eq!(report.duplicates_found, 1);
        assert_eq!(report.termination, TerminationReason::Stuck);
    }

    #[tokio::test]
    async fn empty_page_on_call_n_means_n_fetches() {
        for n in 1..=5usize {
            let mut script: Vec<Scripted> = (1..n as i64)
                .map(|i| page(&[i], Some(&format!("c{i}"))))
                .collect();
            script.push(Ok(Page::raw_empty()));
            let fetcher = ScriptedFetcher::new(script);

            let report = no_delay().run_fresh(None, &fetcher).await.expect("run");
            assert_eq!(report.total_requests, n);
            assert_eq!(fetcher.calls(), n);
            assert_eq!(report.records.len(), n - 1);
            assert_eq!(report.termination, TerminationReason::Exhausted);
        }
    }

    #[tokio::test]
    async fn failure_keeps_partial_snapshot_in_session() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&[1, 2], Some("t1")),
            page(&[2, 3, 4], Some("t2")),
            Err(FetchError::HttpStatus {
                status: 502,
                url: "https://api.example.test/lists".into(),
            }),
        ]);
        let driver = no_delay();
        let mut session = FetchSession::new();

        let err = driver.run_all(&mut session, None, &fetcher).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.total_requests(), 3);
        assert_eq!(session.duplicates_found(), 1);
        assert_eq!(
            ids(&session.snapshot()),
            vec![1.into(), 2.into(), 3.into(), 4.into()]
        );
        assert_eq!(session.cursor(), Some(&Cursor::from("t2")));
    }

    #[tokio::test]
    async fn malformed_page_is_fatal() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&[1], Some("t1")),
            Err(FetchError::MalformedPage("not json".into())),
            page(&[2], Some("t2")),
        ]);
        let mut session = FetchSession::new();
        let err = no_delay().run_all(&mut session, None, &fetcher).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedPage(_)));
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(session.unique_records(), 1);
    }

    #[tokio::test]
    async fn missing_next_cursor_ends_run() {
        let fetcher = ScriptedFetcher::new(vec![page(&[1, 2], None), page(&[3], Some("never"))]);
        let report = no_delay().run_fresh(None, &fetcher).await.expect("run");
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.termination, TerminationReason::Exhausted);
    }

    #[tokio::test]
    async fn initial_cursor_is_used_for_first_fetch() {
        let fetcher = ScriptedFetcher::new(vec![page(&[9], None)]);
        no_delay()
            .run_fresh(Some(Cursor::from("2024-01-01")), &fetcher)
            .await
            .expect("run");
        assert_eq!(fetcher.cursors(), vec![Some(Cursor::from("2024-01-01"))]);
    }

    #[tokio::test]
    async fn cancellation_returns_partial_snapshot() {
        let token = CancellationToken::new();
        let fetcher = ScriptedFetcher {
            script: Mutex::new(
                vec![page(&[1], Some("a")), page(&[2], Some("b")), page(&[3], Some("c"))].into(),
            ),
            cancel_after: Some((2, token.clone())),
            ..Default::default()
        };
        let driver = PaginationDriver::new(DriverOptions {
            inter_page_delay: Duration::ZERO,
            cancellation: Some(token),
            ..Default::default()
        });

        let mut session = FetchSession::new();
        let report = driver.run_all(&mut session, None, &fetcher).await.expect("run");
        assert_eq!(report.termination, TerminationReason::Cancelled);
        assert_eq!(report.total_requests, 2);
        assert_eq!(ids(&report.records), vec![1.into(), 2.into()]);
        assert_eq!(session.state(), SessionState::Done(TerminationReason::Cancelled));
    }

    #[tokio::test]
    async fn pre_cancelled_token_makes_no_requests() {
        let token = CancellationToken::new();
        token.cancel();
        let fetcher = ScriptedFetcher::new(vec![page(&[1], Some("a"))]);
        let driver = PaginationDriver::new(DriverOptions {
            cancellation: Some(token),
            ..Default::default()
        });
        let report = driver.run_fresh(None, &fetcher).await.expect("run");
        assert_eq!(report.total_requests, 0);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(report.termination, TerminationReason::Cancelled);
    }

    #[tokio::test]
    async fn page_limit_caps_requests() {
        let fetcher = ScriptedFetcher::new(
            (1..=10).map(|i| page(&[i], Some(&format!("c{i}")))).collect(),
        );
        let driver = PaginationDriver::new(DriverOptions {
            inter_page_delay: Duration::ZERO,
            max_pages: Some(3),
            ..Default::default()
        });
        let report = driver.run_fresh(None, &fetcher).await.expect("run");
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.termination, TerminationReason::PageLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn inter_page_delay_is_applied_between_pages() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&[1], Some("a")),
            page(&[2], Some("b")),
            page(&[], None),
        ]);
        let driver = PaginationDriver::default();
        let started = tokio::time::Instant::now();
        let report = driver.run_fresh(None, &fetcher).await.expect("run");
        assert_eq!(report.total_requests, 3);
        assert!(started.elapsed() >= DEFAULT_INTER_PAGE_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wakes_a_pending_delay() {
        let token = CancellationToken::new();
        let fetcher = ScriptedFetcher::new(vec![page(&[1], Some("a")), page(&[2], Some("b"))]);
        let delay = Duration::from_secs(3600);
        let driver = PaginationDriver::new(DriverOptions {
            inter_page_delay: delay,
            cancellation: Some(token.clone()),
            ..Default::default()
        });

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let started = tokio::time::Instant::now();
        let report = driver.run_fresh(None, &fetcher).await.expect("run");
        canceller.await.expect("canceller");

        assert!(started.elapsed() < delay);
        assert_eq!(report.termination, TerminationReason::Cancelled);
        assert_eq!(report.total_requests, 1);
        assert_eq!(ids(&report.records), vec![1.into()]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn session_reuse_starts_clean() {
        let driver = no_delay();
        let mut session = FetchSession::new();
        let first = ScriptedFetcher::new(vec![page(&[1, 2], None)]);
        driver.run_all(&mut session, None, &first).await.expect("first");
        assert_eq!(session.unique_records(), 2);

        let second = ScriptedFetcher::new(vec![page(&[2], None)]);
        let report = driver.run_all(&mut session, None, &second).await.expect("second");
        assert_eq!(ids(&report.records), vec![2.into()]);
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.duplicates_found, 0);
    }

    #[tokio::test]
    async fn per_page_stats_are_recorded() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&[1, 2], Some("t1")),
            page(&[2, 3], Some("t2")),
            Ok(Page::raw_empty()),
        ]);
        let report = no_delay().run_fresh(None, &fetcher).await.expect("run");
        assert_eq!(
            report.pages,
            vec![
                PageStats { request_no: 1, received: 2, added: 2, duplicates: 0, raw_empty: false },
                PageStats { request_no: 2, received: 2, added: 1, duplicates: 1, raw_empty: false },
                PageStats { request_no: 3, received: 0, added: 0, duplicates: 0, raw_empty: true },
            ]
        );
    }
}
