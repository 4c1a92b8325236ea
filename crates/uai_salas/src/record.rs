/// Types for schedule records, from raw source rows to the normalized shape
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Classification of a scheduled occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Lecture,
    Tutorial,
    Other,
}

impl EventKind {
    /// Returns true if records of this kind belong in the cumulative log.
    pub fn is_cumulative(&self) -> bool {
        matches!(self, EventKind::Lecture | EventKind::Tutorial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Lecture => "lecture",
            EventKind::Tutorial => "tutorial",
            EventKind::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    /// Parses the stored form produced by [`EventKind::as_str`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lecture" => Ok(EventKind::Lecture),
            "tutorial" => Ok(EventKind::Tutorial),
            "other" => Ok(EventKind::Other),
            _ => Err(format!("unknown event kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    /// Day of the week the given date falls on.
    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Sunday => "Sunday",
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
        }
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Sun => Weekday::Sunday,
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weekday {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sunday" => Ok(Weekday::Sunday),
            "Monday" => Ok(Weekday::Monday),
            "Tuesday" => Ok(Weekday::Tuesday),
            "Wednesday" => Ok(Weekday::Wednesday),
            "Thursday" => Ok(Weekday::Thursday),
            "Friday" => Ok(Weekday::Friday),
            "Saturday" => Ok(Weekday::Saturday),
            _ => Err(format!("unknown weekday: {s}")),
        }
    }
}

/// One unnormalized row as yielded by a page source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRow {
    /// Header-keyed cells, e.g. a row of an exported spreadsheet
    Keyed(BTreeMap<String, String>),
    /// Cells in column order, e.g. a `<tr>` of the HTML listing
    Positional(Vec<String>),
}

impl RawRow {
    /// Convenience constructor for keyed rows.
    pub fn keyed<K, V, I>(cells: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        RawRow::Keyed(
            cells
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn positional<V: Into<String>, I: IntoIterator<Item = V>>(cells: I) -> Self {
        RawRow::Positional(cells.into_iter().map(Into::into).collect())
    }
}

/// One scheduled occurrence after normalization.
///
/// Location fields are `None` when the source left them blank; they are never
/// stored as empty strings so the loose natural-key match stays meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub kind: EventKind,
    pub title: String,
    pub room: Option<String>,
    pub building: Option<String>,
    pub campus: Option<String>,
    pub start_time: String,
    pub end_time: String,
    /// Date of the run that observed this record, never parsed from the source
    pub snapshot_date: NaiveDate,
    pub weekday: Weekday,
    /// Source columns with no dedicated field; snapshot-only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}
