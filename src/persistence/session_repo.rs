//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::session::{DesiredState, Destination, Session, SessionStatus, StreamSource};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_ts};

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    name: String,
    owner: String,
    source: String,
    destination: String,
    desired_state: String,
    status: String,
    process_ref: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let source: StreamSource = serde_json::from_str(&self.source)
            .map_err(|e| AppError::DbRejected(format!("invalid source: {e}")))?;
        let destination: Destination = serde_json::from_str(&self.destination)
            .map_err(|e| AppError::DbRejected(format!("invalid destination: {e}")))?;

        Ok(Session {
            id: self.id,
            name: self.name,
            owner: self.owner,
            source,
            destination,
            desired_state: parse_desired_state(&self.desired_state)?,
            status: parse_status(&self.status)?,
            process_ref: self.process_ref,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

fn parse_desired_state(s: &str) -> Result<DesiredState> {
    match s {
        "stopped" => Ok(DesiredState::Stopped),
        "running" => Ok(DesiredState::Running),
        other => Err(AppError::DbRejected(format!("invalid desired_state: {other}"))),
    }
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "idle" => Ok(SessionStatus::Idle),
        "starting" => Ok(SessionStatus::Starting),
        "running" => Ok(SessionStatus::Running),
        "stopping" => Ok(SessionStatus::Stopping),
        "failed" => Ok(SessionStatus::Failed),
        other => Err(AppError::DbRejected(format!("invalid session status: {other}"))),
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        let source = serde_json::to_string(&session.source)
            .map_err(|e| AppError::DbRejected(format!("serialize source: {e}")))?;
        let destination = serde_json::to_string(&session.destination)
            .map_err(|e| AppError::DbRejected(format!("serialize destination: {e}")))?;

        sqlx::query(
            "INSERT INTO sessions (id, name, owner, source, destination, desired_state,
             status, process_ref, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.owner)
        .bind(&source)
        .bind(&destination)
        .bind(session.desired_state.as_str())
        .bind(session.status.as_str())
        .bind(&session.process_ref)
        .bind(fmt_ts(session.created_at))
        .bind(fmt_ts(session.updated_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List every session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions ORDER BY created_at ASC, id ASC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions currently in `status`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE status = ?1 ORDER BY created_at ASC")
                .bind(status.as_str())
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Update session status, process reference and `updated_at`,
    /// respecting the state machine.
    ///
    /// The write is conditional on the status read beforehand, so a
    /// concurrent writer cannot be silently overwritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist,
    /// `AppError::InvalidTransition` if the transition is not permitted or
    /// the status changed underneath, or `AppError::Db` if persistence fails.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        process_ref: Option<&str>,
    ) -> Result<Session> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;

        if !current.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "session {id}: {} -> {status}",
                current.status
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, process_ref = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(status.as_str())
        .bind(process_ref)
        .bind(fmt_ts(now))
        .bind(id)
        .bind(current.status.as_str())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "session {id}: status changed concurrently"
            )));
        }

        current.status = status;
        current.process_ref = process_ref.map(ToOwned::to_owned);
        current.updated_at = now;
        Ok(current)
    }

    /// Record the desired state for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn set_desired_state(&self, id: &str, desired: DesiredState) -> Result<Session> {
        let result =
            sqlx::query("UPDATE sessions SET desired_state = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(desired.as_str())
                .bind(fmt_ts(Utc::now()))
                .bind(id)
                .execute(self.db.as_ref())
                .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Remove a session and every schedule attached to it in one transaction.
    ///
    /// Returns the number of schedules removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the transaction fails.
    pub async fn delete_with_schedules(&self, id: &str) -> Result<u64> {
        let mut tx = self.db.begin().await?;

        let schedules = sqlx::query("DELETE FROM schedules WHERE session_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let sessions = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if sessions == 0 {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!("session {id} not found")));
        }

        tx.commit().await?;
        Ok(schedules)
    }
}
