//! One ingestion run: drain the source, normalize, reconcile into the store.
//!
//! ```text
//! Idle -> Fetching <-> Normalizing -> Reconciling -> Done
//!            \             |
//!             +--------> Failed
//! ```
//!
//! A fetch error fails the run before anything is written. Store problems
//! never fail the process; they are reported in the [`RunSummary`].

use crate::normalize::Normalizer;
use crate::record::{Record, Weekday};
use crate::source::{FetchError, PageFetcher};
use crate::store::{ReconcilingStore, StoreError};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Fetching,
    Normalizing,
    Reconciling,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a run, the only thing handed back to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub success: bool,
    /// Raw rows received from the source
    pub fetched_count: usize,
    pub normalized_count: usize,
    pub skipped_count: usize,
    pub inserted_snapshot_count: usize,
    pub inserted_cumulative_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives a fetcher and an optional store through one run.
pub struct Pipeline<F> {
    fetcher: F,
    normalizer: Normalizer,
    store: Option<Box<dyn ReconcilingStore>>,
    state: RunState,
}

impl<F: PageFetcher> Pipeline<F> {
    /// Creates a pipeline in fetch-and-normalize-only mode.
    pub fn new(fetcher: F, normalizer: Normalizer) -> Self {
        Self {
            fetcher,
            normalizer,
            store: None,
            state: RunState::Idle,
        }
    }

    /// Persists results to `store`.
    pub fn with_store(mut self, store: impl ReconcilingStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn store(&self) -> Option<&dyn ReconcilingStore> {
        self.store.as_deref()
    }

    /// Runs with today's UTC date as the run date.
    pub async fn run(&mut self) -> RunSummary {
        self.run_on(Utc::now().date_naive()).await
    }

    /// Runs with a fixed run date. Every record of the run shares it.
    pub async fn run_on(&mut self, run_date: NaiveDate) -> RunSummary {
        let weekday = Weekday::of(run_date);
        info!(date = %run_date, weekday = %weekday, "Starting ingestion run");

        let mut summary = RunSummary::default();

        let records = match self.collect(run_date, &mut summary).await {
            Ok(records) => records,
            Err(e) => {
                self.transition(RunState::Failed);
                error!(
                    error = %e,
                    fetched = summary.fetched_count,
                    "Fetch failed, nothing persisted"
                );
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        self.transition(RunState::Reconciling);
        summary.success = true;

        match self.store.as_deref() {
            Some(store) => reconcile(store, &records, run_date, weekday, &mut summary),
            None => info!("No store configured, skipping persistence"),
        }

        self.transition(RunState::Done);
        info!(
            success = summary.success,
            fetched = summary.fetched_count,
            normalized = summary.normalized_count,
            skipped = summary.skipped_count,
            snapshot = summary.inserted_snapshot_count,
            cumulative = summary.inserted_cumulative_count,
            "Run finished"
        );
        summary
    }

    /// Drains the fetcher, normalizing each page as it arrives.
    async fn collect(
        &mut self,
        run_date: NaiveDate,
        summary: &mut RunSummary,
    ) -> Result<Vec<Record>, FetchError> {
        let mut records = Vec::new();
        let mut page_number = 0u32;

        loop {
            self.transition(RunState::Fetching);
            let page = self.fetcher.next_page().await?;
            page_number += 1;
            summary.fetched_count += page.rows.len();

            self.transition(RunState::Normalizing);
            for (i, raw) in page.rows.iter().enumerate() {
                match self.normalizer.normalize(raw, run_date) {
                    Ok(record) => records.push(record),
                    Err(reason) => {
                        summary.skipped_count += 1;
                        debug!(page = page_number, row = i + 1, reason = %reason, "Skipped row");
                    }
                }
            }
            summary.normalized_count = records.len();
            debug!(page = page_number, rows = page.rows.len(), total = records.len(), "Page normalized");

            if page.done {
                break;
            }
        }

        if summary.skipped_count > 0 {
            warn!(skipped = summary.skipped_count, "Rows dropped for missing required fields");
        }
        Ok(records)
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Run state changed");
            self.state = next;
        }
    }
}

/// Applies both store operations, recording outcomes in `summary`.
fn reconcile(
    store: &dyn ReconcilingStore,
    records: &[Record],
    run_date: NaiveDate,
    weekday: Weekday,
    summary: &mut RunSummary,
) {
    match store.replace_snapshot(records, run_date) {
        Ok(count) => summary.inserted_snapshot_count = count,
        Err(e) => {
            store_failed(summary, &e);
            return;
        }
    }

    if records.is_empty() {
        info!(date = %run_date, "No events today, cleared snapshot only");
        return;
    }

    match store.append_deduplicated(records, run_date, weekday) {
        Ok(count) => summary.inserted_cumulative_count = count,
        Err(e @ StoreError::PartialInsert { .. }) => {
            // Missed rows are still new next run
            warn!(error = %e, "Cumulative append stopped early");
            summary.inserted_cumulative_count = e.inserted();
            summary.error = Some(e.to_string());
        }
        Err(e) => store_failed(summary, &e),
    }
}

fn store_failed(summary: &mut RunSummary, e: &StoreError) {
    if e.is_unavailable() {
        summary.inserted_snapshot_count = 0;
        summary.inserted_cumulative_count = 0;
    }
    error!(error = %e, "Store operation failed");
    summary.success = false;
    summary.error = Some(e.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventKind, RawRow};
    use crate::source::Page;
    use crate::store::test_support::date;
    use crate::store::{MemoryStore, SqliteStore, TableNames};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays a fixed script of pages and errors.
    struct ScriptedFetcher {
        script: VecDeque<Result<Page, FetchError>>,
    }

    impl ScriptedFetcher {
        fn new(script: impl IntoIterator<Item = Result<Page, FetchError>>) -> Self {
            Self {
                script: script.into_iter().collect(),
            }
        }

        fn single(rows: Vec<RawRow>) -> Self {
            Self::new([Ok(Page::last(rows))])
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn next_page(&mut self) -> Result<Page, FetchError> {
            self.script
                .pop_front()
                .unwrap_or_else(|| panic!("fetcher polled after its last page"))
        }
    }

    fn row(title: &str, kind: &str, start: &str, end: &str, room: &str) -> RawRow {
        RawRow::positional([title, kind, start, end, room, "", ""])
    }

    fn five_rows_third_untitled() -> Vec<RawRow> {
        vec![
            row("Álgebra", "Cátedra", "10:00", "11:20", "B201"),
            row("Cálculo", "Ayudantía", "11:30", "12:50", "A101"),
            row("", "Cátedra", "13:00", "14:20", "C305"),
            row("Física", "Cátedra", "14:30", "15:50", ""),
            row("Charla de bienvenida", "Evento", "18:00", "19:00", "Aula Magna"),
        ]
    }

    fn pipeline(fetcher: ScriptedFetcher) -> Pipeline<ScriptedFetcher> {
        Pipeline::new(fetcher, Normalizer::default())
    }

    #[tokio::test]
    async fn test_untitled_row_is_skipped_and_run_completes() {
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(MemoryStore::new());

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert_eq!(p.state(), RunState::Done);
        assert!(summary.success);
        assert_eq!(summary.fetched_count, 5);
        assert_eq!(summary.normalized_count, 4);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.inserted_snapshot_count, 4);
        // Álgebra, Cálculo and Física are cumulative kinds; the talk is not
        assert_eq!(summary.inserted_cumulative_count, 3);
        assert_eq!(summary.error, None);
    }

    #[tokio::test]
    async fn test_cumulative_rows_carry_run_weekday() {
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(MemoryStore::new());

        // 2024-03-12 was a Tuesday
        p.run_on(date(2024, 3, 12)).await;

        let stored = p.store().unwrap().cumulative_records().unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| r.weekday == Weekday::Tuesday));
        assert!(stored.iter().all(|r| r.snapshot_date == date(2024, 3, 12)));
    }

    #[tokio::test]
    async fn test_pages_accumulate_in_order() {
        let fetcher = ScriptedFetcher::new([
            Ok(Page::more(vec![row("Álgebra", "Cátedra", "10:00", "11:20", "B201")])),
            Ok(Page::more(vec![])),
            Ok(Page::last(vec![row("Cálculo", "Ayudantía", "11:30", "12:50", "A101")])),
        ]);
        let mut p = pipeline(fetcher).with_store(MemoryStore::new());

        let summary = p.run_on(date(2024, 3, 12)).await;
        assert_eq!(summary.fetched_count, 2);

        let snapshot = p.store().unwrap().snapshot_for(date(2024, 3, 12)).unwrap();
        let titles: Vec<&str> = snapshot.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["Álgebra", "Cálculo"]);
    }

    #[tokio::test]
    async fn test_empty_day_clears_snapshot_and_keeps_cumulative() {
        let day = date(2024, 3, 12);
        let store = MemoryStore::new();

        let normalizer = Normalizer::default();
        let prior: Vec<Record> = five_rows_third_untitled()
            .iter()
            .filter_map(|r| normalizer.normalize(r, day).ok())
            .collect();
        store.replace_snapshot(&prior, day).unwrap();
        store.append_deduplicated(&prior, day, Weekday::Tuesday).unwrap();
        let cumulative_before = store.cumulative_len().unwrap();

        let mut p = pipeline(ScriptedFetcher::single(vec![])).with_store(store);
        let summary = p.run_on(day).await;

        assert!(summary.success);
        assert_eq!(summary.fetched_count, 0);
        assert_eq!(summary.inserted_snapshot_count, 0);
        assert_eq!(summary.inserted_cumulative_count, 0);
        assert_eq!(p.state(), RunState::Done);

        let store = p.store().unwrap();
        assert!(store.snapshot_for(day).unwrap().is_empty());
        assert_eq!(store.cumulative_len().unwrap(), cumulative_before);
    }

    #[tokio::test]
    async fn test_second_run_same_day_inserts_nothing_new() {
        let day = date(2024, 3, 12);
        let mut first = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(MemoryStore::new());
        first.run_on(day).await;

        let store = first.store.take().unwrap();
        let mut second = Pipeline::new(
            ScriptedFetcher::single(five_rows_third_untitled()),
            Normalizer::default(),
        );
        second.store = Some(store);

        let summary = second.run_on(day).await;
        assert_eq!(summary.inserted_snapshot_count, 4);
        assert_eq!(summary.inserted_cumulative_count, 0);
        assert_eq!(second.store().unwrap().snapshot_for(day).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_error_fails_without_persisting() {
        let fetcher = ScriptedFetcher::new([
            Ok(Page::more(vec![row("Álgebra", "Cátedra", "10:00", "11:20", "B201")])),
            Err(FetchError::HttpStatus { page: 2, status: 500 }),
        ]);
        let mut p = pipeline(fetcher).with_store(MemoryStore::new());

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert_eq!(p.state(), RunState::Failed);
        assert!(!summary.success);
        assert_eq!(summary.fetched_count, 1);
        assert_eq!(summary.inserted_snapshot_count, 0);
        assert!(summary.error.unwrap().contains("500"));

        let store = p.store().unwrap();
        assert!(store.snapshot_for(date(2024, 3, 12)).unwrap().is_empty());
        assert_eq!(store.cumulative_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_reports_counts_so_far() {
        let fetcher = ScriptedFetcher::new([
            Ok(Page::more(vec![
                row("Álgebra", "Cátedra", "10:00", "11:20", "B201"),
                row("", "Cátedra", "13:00", "14:20", "C305"),
            ])),
            Err(FetchError::Network {
                message: "connection reset".to_string(),
            }),
        ]);
        let mut p = pipeline(fetcher);

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert!(!summary.success);
        assert_eq!(summary.fetched_count, 2);
        assert_eq!(summary.normalized_count, 1);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.fetched_count, summary.normalized_count + summary.skipped_count);
    }

    #[tokio::test]
    async fn test_sqlite_store_end_to_end() {
        let day = date(2024, 3, 12);
        let store = SqliteStore::in_memory(TableNames::default()).unwrap();
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(store);

        let summary = p.run_on(day).await;

        assert!(summary.success, "{summary:?}");
        assert_eq!(summary.inserted_snapshot_count, 4);
        assert_eq!(summary.inserted_cumulative_count, 3);

        let store = p.store().unwrap();
        let snapshot = store.snapshot_for(day).unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[3].extra.get("Tipo").map(String::as_str), Some("Evento"));

        let cumulative = store.cumulative_records().unwrap();
        assert_eq!(cumulative.len(), 3);
        assert!(cumulative.iter().all(|r| r.weekday == Weekday::Tuesday));
    }

    #[tokio::test]
    async fn test_unopenable_sqlite_store_reports_zero_persisted() {
        let store = SqliteStore::new("sqlite:///nonexistent/dir/salas.db", TableNames::default()).unwrap();
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(store);

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert_eq!(p.state(), RunState::Done);
        assert!(!summary.success);
        assert_eq!(summary.fetched_count, 5);
        assert_eq!(summary.normalized_count, 4);
        assert_eq!(summary.inserted_snapshot_count, 0);
        assert_eq!(summary.inserted_cumulative_count, 0);
        assert!(summary.error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_without_store_only_normalizes() {
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled()));

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert!(summary.success);
        assert!(p.store().is_none());
        assert_eq!(summary.normalized_count, 4);
        assert_eq!(summary.inserted_snapshot_count, 0);
        assert_eq!(summary.inserted_cumulative_count, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_zero_persisted() {
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(MemoryStore::unavailable());

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert_eq!(p.state(), RunState::Done);
        assert!(!summary.success);
        assert_eq!(summary.fetched_count, 5);
        assert_eq!(summary.normalized_count, 4);
        assert_eq!(summary.inserted_snapshot_count, 0);
        assert_eq!(summary.inserted_cumulative_count, 0);
        assert!(summary.error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_partial_insert_is_not_a_failure() {
        let mut p = pipeline(ScriptedFetcher::single(five_rows_third_untitled())).with_store(MemoryStore::failing_after(2));

        let summary = p.run_on(date(2024, 3, 12)).await;

        assert!(summary.success);
        assert_eq!(summary.inserted_snapshot_count, 4);
        assert_eq!(summary.inserted_cumulative_count, 2);
        assert!(summary.error.is_some());
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = RunSummary {
            success: true,
            fetched_count: 5,
            normalized_count: 4,
            skipped_count: 1,
            inserted_snapshot_count: 4,
            inserted_cumulative_count: 3,
            error: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["fetchedCount"], 5);
        assert_eq!(json["insertedCumulativeCount"], 3);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_kinds_in_fixture() {
        let n = Normalizer::default();
        let kinds: Vec<EventKind> = five_rows_third_untitled()
            .iter()
            .filter_map(|r| n.normalize(r, date(2024, 3, 12)).ok())
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            [EventKind::Lecture, EventKind::Tutorial, EventKind::Lecture, EventKind::Other]
        );
    }
}
