//! Daily ingestion of the university's room and event schedule.
//!
//! A run pulls the day's rows from a [`source::PageFetcher`], turns them into
//! [`record::Record`]s and reconciles them into a per-date snapshot table plus
//! a deduplicated cumulative log.

pub mod config;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod store;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, RunState, RunSummary};
pub use record::{EventKind, RawRow, Record, Weekday};
