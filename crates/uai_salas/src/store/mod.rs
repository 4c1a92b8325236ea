//! Persistence for harvested records.
//!
//! Two logical tables are maintained:
//! - the snapshot table, fully replaced for a run date on every run
//! - the cumulative table, append-only and deduplicated by [`NaturalKey`]
//!
//! The two operations are independent. Neither store realization makes the
//! pair atomic, so a crash between them leaves a fresh snapshot next to a
//! cumulative table that has not seen this run yet.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, TableNames};

use crate::record::{EventKind, Record, Weekday};
use chrono::NaiveDate;
use thiserror::Error;

/// Errors from the reconciling store.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The backing store could not be reached or initialised
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A batch stopped part way; `inserted` rows were written before the failure
    #[error("Inserted {inserted} of {attempted} records before failing: {message}")]
    PartialInsert {
        inserted: usize,
        attempted: usize,
        message: String,
    },

    /// A statement failed and its effects were rolled back
    #[error("Query failed: {message}")]
    Query { message: String },

    /// Store configuration is unusable
    #[error("Invalid store configuration: {message}")]
    Config { message: String },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    /// Rows written before the error, if any.
    pub fn inserted(&self) -> usize {
        match self {
            StoreError::PartialInsert { inserted, .. } => *inserted,
            _ => 0,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Query {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Query {
            message: err.to_string(),
        }
    }
}

/// The fields deciding whether two records are the same real-world occurrence.
///
/// Required parts compare exactly. Location parts compare loosely: a value
/// missing on either side matches anything, so only two conflicting values
/// make records distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaturalKey<'a> {
    pub kind: EventKind,
    pub title: &'a str,
    pub start_time: &'a str,
    pub end_time: &'a str,
    pub room: Option<&'a str>,
    pub building: Option<&'a str>,
    pub campus: Option<&'a str>,
}

impl<'a> NaturalKey<'a> {
    pub fn of(record: &'a Record) -> Self {
        Self {
            kind: record.kind,
            title: &record.title,
            start_time: &record.start_time,
            end_time: &record.end_time,
            room: record.room.as_deref(),
            building: record.building.as_deref(),
            campus: record.campus.as_deref(),
        }
    }

    /// Loose equality used for the cumulative-table existence check.
    pub fn matches(&self, other: &NaturalKey<'_>) -> bool {
        self.kind == other.kind
            && self.title == other.title
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && loose_eq(self.room, other.room)
            && loose_eq(self.building, other.building)
            && loose_eq(self.campus, other.campus)
    }
}

fn loose_eq(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Store holding the snapshot and cumulative tables.
pub trait ReconcilingStore: Send + Sync {
    /// Replaces every snapshot row tagged `run_date` with `records`.
    ///
    /// Afterwards the snapshot for `run_date` is exactly `records`. Supporting
    /// indexes are created if missing. Returns the number of rows written.
    fn replace_snapshot(&self, records: &[Record], run_date: NaiveDate) -> Result<usize, StoreError>;

    /// Inserts lecture/tutorial records whose natural key is not yet present.
    ///
    /// Each candidate is checked before it is inserted, and checks see rows
    /// inserted earlier in the same call. Rows are tagged with `run_date` and
    /// `weekday`. Returns the number of rows written.
    fn append_deduplicated(
        &self,
        records: &[Record],
        run_date: NaiveDate,
        weekday: Weekday,
    ) -> Result<usize, StoreError>;

    /// Snapshot rows tagged `run_date`, in insertion order.
    fn snapshot_for(&self, run_date: NaiveDate) -> Result<Vec<Record>, StoreError>;

    /// Every cumulative row, in insertion order.
    fn cumulative_records(&self) -> Result<Vec<Record>, StoreError>;

    fn cumulative_len(&self) -> Result<usize, StoreError> {
        Ok(self.cumulative_records()?.len())
    }
}

impl<S: ReconcilingStore + ?Sized> ReconcilingStore for Box<S> {
    fn replace_snapshot(&self, records: &[Record], run_date: NaiveDate) -> Result<usize, StoreError> {
        (**self).replace_snapshot(records, run_date)
    }

    fn append_deduplicated(
        &self,
        records: &[Record],
        run_date: NaiveDate,
        weekday: Weekday,
    ) -> Result<usize, StoreError> {
        (**self).append_deduplicated(records, run_date, weekday)
    }

    fn snapshot_for(&self, run_date: NaiveDate) -> Result<Vec<Record>, StoreError> {
        (**self).snapshot_for(run_date)
    }

    fn cumulative_records(&self) -> Result<Vec<Record>, StoreError> {
        (**self).cumulative_records()
    }

    fn cumulative_len(&self) -> Result<usize, StoreError> {
        (**self).cumulative_len()
    }
}
