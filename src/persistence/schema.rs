//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    owner           TEXT NOT NULL,
    source          TEXT NOT NULL,
    destination     TEXT NOT NULL,
    desired_state   TEXT NOT NULL CHECK(desired_state IN ('stopped','running')),
    status          TEXT NOT NULL CHECK(status IN ('idle','starting','running','stopping','failed')),
    process_ref     TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    kind            TEXT NOT NULL CHECK(kind IN ('one_time','daily')),
    time_spec       TEXT NOT NULL,
    timezone        TEXT NOT NULL,
    action          TEXT NOT NULL CHECK(action IN ('start','stop')),
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_fired_at   TEXT,
    next_fire_at    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_session ON schedules(session_id);
CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(enabled, next_fire_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
