/// SQLite-backed reconciling store
use super::{NaturalKey, ReconcilingStore, StoreError};
use crate::record::{EventKind, Record, Weekday};
use chrono::NaiveDate;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = include_str!("../../../../sql/init_events.sql");

/// Names of the two tables, substituted into every statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub snapshot: String,
    pub cumulative: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            snapshot: "eventos".to_string(),
            cumulative: "all_eventos".to_string(),
        }
    }
}

impl TableNames {
    /// Checks both names are plain SQL identifiers.
    pub fn validate(&self) -> Result<(), StoreError> {
        for name in [&self.snapshot, &self.cumulative] {
            let mut chars = name.chars();
            let valid_start = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(StoreError::Config {
                    message: format!("`{name}` is not a valid table name"),
                });
            }
        }
        if self.snapshot == self.cumulative {
            return Err(StoreError::Config {
                message: "snapshot and cumulative tables must differ".to_string(),
            });
        }
        Ok(())
    }
}

pub struct SqliteStore {
    path: String,
    tables: TableNames,
    /// Opened on first use so an unreachable database surfaces as `Unavailable`
    db: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Creates a store for the given connection URI without connecting yet.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, a bare path, or `:memory:`.
    pub fn new(uri: &str, tables: TableNames) -> Result<Self, StoreError> {
        tables.validate()?;

        let path = uri
            .strip_prefix("sqlite://")
            .or_else(|| uri.strip_prefix("sqlite:"))
            .unwrap_or(uri)
            .to_string();

        if path.is_empty() {
            return Err(StoreError::Config {
                message: "empty database path".to_string(),
            });
        }

        Ok(Self {
            path,
            tables,
            db: Mutex::new(None),
        })
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn in_memory(tables: TableNames) -> Result<Self, StoreError> {
        Self::new(":memory:", tables)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|e| StoreError::Unavailable {
            message: format!("failed to open {}: {}", self.path, e),
        })?;

        let schema = SCHEMA_SQL
            .replace("{snapshot}", &self.tables.snapshot)
            .replace("{cumulative}", &self.tables.cumulative);
        conn.execute_batch(&schema)
            .map_err(|e| StoreError::Unavailable {
                message: format!("failed to initialize schema: {}", e),
            })?;

        info!(path = %self.path, "Connected to event store");
        Ok(conn)
    }

    /// Runs `f` against the connection, opening it first if needed.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.db.lock().map_err(|_| StoreError::Unavailable {
            message: "connection lock poisoned".to_string(),
        })?;

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }

        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Unavailable {
                message: "connection not established".to_string(),
            }),
        }
    }

    /// Creates the lookup indexes for a table. Idempotent.
    fn ensure_indexes(conn: &Connection, table: &str, columns: &[&str]) -> Result<(), StoreError> {
        let ddl: String = columns
            .iter()
            .map(|column| {
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table} ({column});\n")
            })
            .collect();
        conn.execute_batch(&ddl)?;
        Ok(())
    }
}

impl ReconcilingStore for SqliteStore {
    fn replace_snapshot(&self, records: &[Record], run_date: NaiveDate) -> Result<usize, StoreError> {
        let table = &self.tables.snapshot;

        self.with_connection(|conn| {
            Self::ensure_indexes(conn, table, &["title", "room", "campus", "snapshot_date"])?;

            let tx = conn.transaction()?;
            let removed = tx.execute(
                &format!("DELETE FROM {table} WHERE snapshot_date = ?1"),
                params![run_date],
            )?;

            {
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {table} (
                        snapshot_date, weekday, kind, title, start_time, end_time,
                        room, building, campus, extra, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))"
                ))?;

                for record in records {
                    let extra = if record.extra.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&record.extra)?)
                    };

                    insert.execute(params![
                        run_date,
                        Weekday::of(run_date),
                        record.kind,
                        record.title,
                        record.start_time,
                        record.end_time,
                        record.room,
                        record.building,
                        record.campus,
                        extra,
                    ])?;
                }
            }

            tx.commit()?;

            info!(
                table = %table,
                date = %run_date,
                removed = removed,
                inserted = records.len(),
                "Replaced snapshot"
            );
            Ok(records.len())
        })
    }

    fn append_deduplicated(
        &self,
        records: &[Record],
        run_date: NaiveDate,
        weekday: Weekday,
    ) -> Result<usize, StoreError> {
        let table = &self.tables.cumulative;

        self.with_connection(|conn| {
            Self::ensure_indexes(
                conn,
                table,
                &["title", "kind", "start_time", "end_time", "snapshot_date"],
            )?;

            let candidates: Vec<&Record> = records.iter().filter(|r| r.kind.is_cumulative()).collect();

            // Optional parts only discriminate when both sides are non-null
            let mut exists = conn.prepare(&format!(
                "SELECT EXISTS (
                    SELECT 1 FROM {table}
                    WHERE kind = ?1 AND title = ?2 AND start_time = ?3 AND end_time = ?4
                      AND (?5 IS NULL OR room IS NULL OR room = ?5)
                      AND (?6 IS NULL OR building IS NULL OR building = ?6)
                      AND (?7 IS NULL OR campus IS NULL OR campus = ?7)
                )"
            ))?;
            let mut insert = conn.prepare(&format!(
                "INSERT INTO {table} (
                    snapshot_date, weekday, kind, title, start_time, end_time,
                    room, building, campus, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))"
            ))?;

            let mut inserted = 0usize;
            for record in &candidates {
                let key = NaturalKey::of(record);

                let outcome = exists
                    .query_row(
                        params![key.kind, key.title, key.start_time, key.end_time, key.room, key.building, key.campus],
                        |row| row.get::<_, bool>(0),
                    )
                    .and_then(|seen| {
                        if seen {
                            return Ok(false);
                        }
                        insert
                            .execute(params![
                                run_date,
                                weekday,
                                key.kind,
                                key.title,
                                key.start_time,
                                key.end_time,
                                key.room,
                                key.building,
                                key.campus,
                            ])
                            .map(|_| true)
                    });

                match outcome {
                    Ok(true) => inserted += 1,
                    Ok(false) => debug!(title = %key.title, start = %key.start_time, "Already logged"),
                    Err(e) => {
                        warn!(
                            table = %table,
                            inserted = inserted,
                            error = %e,
                            "Cumulative insert failed, aborting batch"
                        );
                        return Err(StoreError::PartialInsert {
                            inserted,
                            attempted: candidates.len(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            info!(
                table = %table,
                candidates = candidates.len(),
                inserted = inserted,
                "Appended to cumulative log"
            );
            Ok(inserted)
        })
    }

    fn snapshot_for(&self, run_date: NaiveDate) -> Result<Vec<Record>, StoreError> {
        let table = &self.tables.snapshot;

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT kind, title, room, building, campus, start_time, end_time,
                        snapshot_date, weekday, extra
                 FROM {table}
                 WHERE snapshot_date = ?1
                 ORDER BY event_id"
            ))?;

            let records = stmt
                .query_map(params![run_date], |row| record_from_row(row, true))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn cumulative_records(&self) -> Result<Vec<Record>, StoreError> {
        let table = &self.tables.cumulative;

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT kind, title, room, building, campus, start_time, end_time,
                        snapshot_date, weekday
                 FROM {table}
                 ORDER BY event_id"
            ))?;

            let records = stmt
                .query_map([], |row| record_from_row(row, false))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn cumulative_len(&self) -> Result<usize, StoreError> {
        let table = &self.tables.cumulative;

        self.with_connection(|conn| {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}

fn record_from_row(row: &Row, with_extra: bool) -> rusqlite::Result<Record> {
    let extra = if with_extra {
        match row.get::<_, Option<String>>(9)? {
            Some(json) => serde_json::from_str::<BTreeMap<String, String>>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
            })?,
            None => BTreeMap::new(),
        }
    } else {
        BTreeMap::new()
    };

    Ok(Record {
        kind: row.get(0)?,
        title: row.get(1)?,
        room: row.get(2)?,
        building: row.get(3)?,
        campus: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        snapshot_date: row.get(7)?,
        weekday: row.get(8)?,
        extra,
    })
}

impl ToSql for EventKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for Weekday {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Weekday {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}
