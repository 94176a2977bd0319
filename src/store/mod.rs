//! Persistence gateway.
//!
//! All durable state (sessions, phase records, tasks) lives in one SQLite
//! database owned by `PipelineDb`. Async callers go through `DbHandle`,
//! which runs every access on the blocking pool.
//!
//! Writes that move a session are guarded by the session's `epoch` and
//! cursor, so a stale writer (a step that raced a restart, a late task
//! result) changes nothing and reports `false` instead.

mod db;
mod tasks;

pub use db::{DbHandle, PipelineDb, StepStart};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Fixed-width UTC timestamp, so text ordering in SQL matches time ordering.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.6fZ")
        .with_context(|| format!("Invalid timestamp '{}'", text))?;
    Ok(naive.and_utc())
}

pub(crate) fn parse_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_ts).transpose()
}
