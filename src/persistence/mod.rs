//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod db;
pub mod retry;
pub mod schedule_repo;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Encode a timestamp for storage.
///
/// Fixed-width RFC 3339 in UTC so that text comparison in SQL orders
/// the same way as the instants themselves.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub(crate) fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::DbRejected(format!("invalid {column}: {e}")))
}

/// Decode an optional stored timestamp.
pub(crate) fn parse_opt_ts(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(column, s)).transpose()
}
