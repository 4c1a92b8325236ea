//! Conversion of raw source rows into [`Record`]s.

use crate::record::{EventKind, RawRow, Record, Weekday};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

static CLOCK_TIME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d{1,2})[:.](\d{2})(?::\d{2})?\s*(?:hrs?\.?)?$").unwrap()
});

/// Why a row was dropped instead of becoming a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("required field `{field}` is missing or blank")]
    MissingField { field: &'static str },
}

/// Where each record field lives in a raw row.
///
/// Keyed rows are looked up by header name (case- and accent-insensitive),
/// positional rows by column index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub title: Column,
    pub kind: Column,
    pub start_time: Column,
    pub end_time: Column,
    pub room: Column,
    pub building: Column,
    pub campus: Column,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub header: String,
    pub index: Option<usize>,
}

impl Column {
    fn new(header: &str, index: usize) -> Self {
        Self {
            header: header.to_string(),
            index: Some(index),
        }
    }
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            title: Column::new("Evento", 0),
            kind: Column::new("Tipo", 1),
            start_time: Column::new("Inicio", 2),
            end_time: Column::new("Fin", 3),
            room: Column::new("Sala", 4),
            building: Column::new("Edificio", 5),
            campus: Column::new("Campus", 6),
        }
    }
}

impl ColumnMap {
    fn columns(&self) -> [&Column; 7] {
        [
            &self.title,
            &self.kind,
            &self.start_time,
            &self.end_time,
            &self.room,
            &self.building,
            &self.campus,
        ]
    }
}

/// Turns raw rows into records stamped with the run date.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    columns: ColumnMap,
}

impl Normalizer {
    pub fn new(columns: ColumnMap) -> Self {
        Self { columns }
    }

    /// Normalizes one row.
    ///
    /// `run_date` supplies both `snapshot_date` and `weekday`; nothing date-like
    /// is read from the row itself.
    pub fn normalize(&self, raw: &RawRow, run_date: NaiveDate) -> Result<Record, SkipReason> {
        let cell = |column: &Column| -> Option<String> { lookup(raw, column).and_then(trimmed) };

        let title = cell(&self.columns.title).ok_or(SkipReason::MissingField { field: "title" })?;
        let start_time = cell(&self.columns.start_time)
            .map(|t| canonical_time(&t))
            .ok_or(SkipReason::MissingField { field: "start_time" })?;
        let end_time = cell(&self.columns.end_time)
            .map(|t| canonical_time(&t))
            .ok_or(SkipReason::MissingField { field: "end_time" })?;

        let kind_label = cell(&self.columns.kind);
        let kind = kind_label.as_deref().map(classify).unwrap_or(EventKind::Other);

        // The enum is lossy; the snapshot keeps the source's own wording
        let mut extra = self.unmapped_cells(raw);
        if let Some(label) = kind_label {
            extra.insert(self.columns.kind.header.clone(), label);
        }

        Ok(Record {
            kind,
            title,
            room: cell(&self.columns.room),
            building: cell(&self.columns.building),
            campus: cell(&self.columns.campus),
            start_time,
            end_time,
            snapshot_date: run_date,
            weekday: Weekday::of(run_date),
            extra,
        })
    }

    fn unmapped_cells(&self, raw: &RawRow) -> BTreeMap<String, String> {
        let RawRow::Keyed(cells) = raw else {
            return BTreeMap::new();
        };

        let mapped: Vec<String> = self
            .columns
            .columns()
            .iter()
            .map(|c| fold(&c.header))
            .collect();

        cells
            .iter()
            .filter(|(key, _)| !mapped.contains(&fold(key)))
            .filter_map(|(key, value)| trimmed(value.clone()).map(|v| (key.trim().to_string(), v)))
            .collect()
    }
}

fn lookup(raw: &RawRow, column: &Column) -> Option<String> {
    match raw {
        RawRow::Keyed(cells) => {
            let wanted = fold(&column.header);
            cells
                .iter()
                .find(|(key, _)| fold(key) == wanted)
                .map(|(_, value)| value.clone())
        }
        RawRow::Positional(cells) => column.index.and_then(|i| cells.get(i).cloned()),
    }
}

fn trimmed(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Lowercases and strips the Spanish diacritics the source uses.
fn fold(text: &str) -> String {
    text.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' => 'a',
            'é' | 'è' | 'ë' => 'e',
            'í' | 'ì' | 'ï' => 'i',
            'ó' | 'ò' | 'ö' => 'o',
            'ú' | 'ù' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Maps the free-text classification column onto [`EventKind`].
pub fn classify(text: &str) -> EventKind {
    match fold(text).as_str() {
        "catedra" | "lecture" => EventKind::Lecture,
        "ayudantia" | "tutorial" => EventKind::Tutorial,
        _ => EventKind::Other,
    }
}

/// Rewrites recognisable times of day as `HH:MM`; anything else is returned as is.
///
/// Spreadsheet exports may carry a time cell as a fraction of a day
/// (`0.4375` is 10:30), which is converted as well.
pub fn canonical_time(text: &str) -> String {
    let text = text.trim();

    if let Some(caps) = CLOCK_TIME_REGEX.captures(text) {
        let hour: u32 = caps[1].parse().unwrap_or(u32::MAX);
        let minute: u32 = caps[2].parse().unwrap_or(u32::MAX);
        if hour < 24 && minute < 60 {
            return format!("{hour:02}:{minute:02}");
        }
    }

    if let Ok(fraction) = text.parse::<f64>() {
        if (0.0..1.0).contains(&fraction) {
            let minutes = (fraction * 24.0 * 60.0).round() as u32;
            if minutes < 24 * 60 {
                return format!("{:02}:{:02}", minutes / 60, minutes % 60);
            }
        }
    }

    text.to_string()
}
