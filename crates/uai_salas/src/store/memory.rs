/// In-process store with the same semantics as the SQLite one
use super::{NaturalKey, ReconcilingStore, StoreError};
use crate::record::{Record, Weekday};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Default)]
struct Tables {
    snapshot: Vec<Record>,
    cumulative: Vec<Record>,
}

/// Keeps both tables in memory. Useful for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: bool,
    /// Cumulative inserts allowed before every further insert fails
    insert_budget: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails as unreachable.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// A store whose cumulative inserts start failing after `inserts` successes.
    pub fn failing_after(inserts: usize) -> Self {
        Self {
            insert_budget: Some(inserts),
            ..Self::default()
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable {
                message: "memory store marked unavailable".to_string(),
            });
        }
        self.tables.lock().map_err(|_| StoreError::Unavailable {
            message: "store lock poisoned".to_string(),
        })
    }
}

impl ReconcilingStore for MemoryStore {
    fn replace_snapshot(&self, records: &[Record], run_date: NaiveDate) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;

        let before = tables.snapshot.len();
        tables.snapshot.retain(|r| r.snapshot_date != run_date);
        let removed = before - tables.snapshot.len();

        tables.snapshot.extend(records.iter().map(|r| Record {
            snapshot_date: run_date,
            weekday: Weekday::of(run_date),
            ..r.clone()
        }));

        info!(date = %run_date, removed = removed, inserted = records.len(), "Replaced snapshot");
        Ok(records.len())
    }

    fn append_deduplicated(
        &self,
        records: &[Record],
        run_date: NaiveDate,
        weekday: Weekday,
    ) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;

        let candidates: Vec<&Record> = records.iter().filter(|r| r.kind.is_cumulative()).collect();
        let mut inserted = 0usize;

        for record in &candidates {
            let key = NaturalKey::of(record);
            if tables.cumulative.iter().any(|r| NaturalKey::of(r).matches(&key)) {
                debug!(title = %key.title, start = %key.start_time, "Already logged");
                continue;
            }

            if let Some(budget) = self.insert_budget {
                if tables.cumulative.len() >= budget {
                    return Err(StoreError::PartialInsert {
                        inserted,
                        attempted: candidates.len(),
                        message: format!("insert budget of {budget} rows exhausted"),
                    });
                }
            }

            tables.cumulative.push(Record {
                snapshot_date: run_date,
                weekday,
                extra: BTreeMap::new(),
                ..(*record).clone()
            });
            inserted += 1;
        }

        info!(candidates = candidates.len(), inserted = inserted, "Appended to cumulative log");
        Ok(inserted)
    }

    fn snapshot_for(&self, run_date: NaiveDate) -> Result<Vec<Record>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .snapshot
            .iter()
            .filter(|r| r.snapshot_date == run_date)
            .cloned()
            .collect())
    }

    fn cumulative_records(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.lock()?.cumulative.clone())
    }
}
