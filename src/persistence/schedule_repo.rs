//! Schedule repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::schedule::{Schedule, ScheduleAction, ScheduleKind, TimeSpec};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for schedule records.
#[derive(Clone)]
pub struct ScheduleRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    session_id: String,
    kind: String,
    time_spec: String,
    timezone: String,
    action: String,
    enabled: bool,
    last_fired_at: Option<String>,
    next_fire_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    /// Convert a database row into the domain model.
    fn into_schedule(self) -> Result<Schedule> {
        let kind = parse_kind(&self.kind)?;
        let time = TimeSpec::parse(kind, &self.time_spec)
            .map_err(|e| AppError::DbRejected(format!("schedule {}: {e}", self.id)))?;

        Ok(Schedule {
            time,
            action: parse_action(&self.action)?,
            enabled: self.enabled,
            last_fired_at: parse_opt_ts("last_fired_at", self.last_fired_at.as_deref())?,
            next_fire_at: parse_opt_ts("next_fire_at", self.next_fire_at.as_deref())?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            id: self.id,
            session_id: self.session_id,
            timezone: self.timezone,
        })
    }
}

fn parse_kind(s: &str) -> Result<ScheduleKind> {
    match s {
        "one_time" => Ok(ScheduleKind::OneTime),
        "daily" => Ok(ScheduleKind::Daily),
        other => Err(AppError::DbRejected(format!("invalid schedule kind: {other}"))),
    }
}

fn parse_action(s: &str) -> Result<ScheduleAction> {
    match s {
        "start" => Ok(ScheduleAction::Start),
        "stop" => Ok(ScheduleAction::Stop),
        other => Err(AppError::DbRejected(format!("invalid schedule action: {other}"))),
    }
}

/// Outcome of committing a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireCommit {
    /// Occurrence recorded as fired.
    pub last_fired_at: DateTime<Utc>,
    /// Next occurrence, `None` when the schedule is exhausted.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Whether the schedule stays enabled.
    pub enabled: bool,
}

impl ScheduleRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new schedule record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DbRejected` on a foreign key violation when the
    /// session does not exist, or `AppError::Db` if the insert fails.
    pub async fn create(&self, schedule: &Schedule) -> Result<Schedule> {
        sqlx::query(
            "INSERT INTO schedules (id, session_id, kind, time_spec, timezone, action,
             enabled, last_fired_at, next_fire_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&schedule.id)
        .bind(&schedule.session_id)
        .bind(schedule.kind().as_str())
        .bind(schedule.time.to_stored())
        .bind(&schedule.timezone)
        .bind(schedule.action.as_str())
        .bind(schedule.enabled)
        .bind(schedule.last_fired_at.map(fmt_ts))
        .bind(schedule.next_fire_at.map(fmt_ts))
        .bind(fmt_ts(schedule.created_at))
        .bind(fmt_ts(schedule.updated_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(schedule.clone())
    }

    /// Retrieve a schedule by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Schedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as("SELECT * FROM schedules WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(ScheduleRow::into_schedule).transpose()
    }

    /// List every schedule, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> =
            sqlx::query_as("SELECT * FROM schedules ORDER BY created_at ASC, id ASC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// List the schedules attached to a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM schedules WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// List enabled schedules whose next occurrence is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM schedules
             WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
             ORDER BY next_fire_at ASC, id ASC",
        )
        .bind(fmt_ts(now))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// Earliest pending occurrence across enabled schedules.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn earliest_pending(&self) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<String>,) = sqlx::query_as(
            "SELECT MIN(next_fire_at) FROM schedules
             WHERE enabled = 1 AND next_fire_at IS NOT NULL",
        )
        .fetch_one(self.db.as_ref())
        .await?;

        parse_opt_ts("next_fire_at", row.0.as_deref())
    }

    /// Overwrite the rule fields and trigger times of an existing schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update(&self, schedule: &Schedule) -> Result<Schedule> {
        let result = sqlx::query(
            "UPDATE schedules SET kind = ?1, time_spec = ?2, timezone = ?3, action = ?4,
             enabled = ?5, last_fired_at = ?6, next_fire_at = ?7, updated_at = ?8
             WHERE id = ?9",
        )
        .bind(schedule.kind().as_str())
        .bind(schedule.time.to_stored())
        .bind(&schedule.timezone)
        .bind(schedule.action.as_str())
        .bind(schedule.enabled)
        .bind(schedule.last_fired_at.map(fmt_ts))
        .bind(schedule.next_fire_at.map(fmt_ts))
        .bind(fmt_ts(schedule.updated_at))
        .bind(&schedule.id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "schedule {} not found",
                schedule.id
            )));
        }
        Ok(schedule.clone())
    }

    /// Record a firing: `last_fired_at`, `next_fire_at` and `enabled` are
    /// written together in one transaction.
    ///
    /// The write only applies if the stored `next_fire_at` still equals
    /// `expected_next`; returns `false` when another writer got there first,
    /// in which case the occurrence must not be dispatched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn commit_fire(
        &self,
        id: &str,
        expected_next: DateTime<Utc>,
        commit: FireCommit,
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE schedules SET last_fired_at = ?1, next_fire_at = ?2, enabled = ?3,
             updated_at = ?4
             WHERE id = ?5 AND enabled = 1 AND next_fire_at = ?6",
        )
        .bind(fmt_ts(commit.last_fired_at))
        .bind(commit.next_fire_at.map(fmt_ts))
        .bind(commit.enabled)
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .bind(fmt_ts(expected_next))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Disable a schedule without touching its trigger history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn disable(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE schedules SET enabled = 0, updated_at = ?1 WHERE id = ?2")
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        Ok(())
    }

    /// Delete a schedule. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
