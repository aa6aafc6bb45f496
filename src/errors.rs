//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure, including invalid
    /// session source/destination at creation time.
    Config(String),
    /// Persistence failure when interacting with `SQLite` that may clear
    /// on retry (busy or locked database, pool timeout, I/O).
    Db(String),
    /// Persistence failure that retrying cannot fix: a constraint
    /// violation, an aborting trigger, or a row that does not decode.
    DbRejected(String),
    /// External encoder process failed to reach the running state.
    ProcessStart(String),
    /// Handle lookup against a session the supervisor is not tracking.
    ProcessNotFound(String),
    /// Supervisory call against the process control facility failed or timed out.
    ProcessControl(String),
    /// Malformed schedule rule or time specification.
    ScheduleValidation(String),
    /// Unresolvable timezone identifier.
    Timezone(String),
    /// Requested session state change is not in the transition table.
    InvalidTransition(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error is a persistence failure worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Db(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::DbRejected(msg) => write!(f, "db rejected: {msg}"),
            Self::ProcessStart(msg) => write!(f, "process start: {msg}"),
            Self::ProcessNotFound(msg) => write!(f, "process not found: {msg}"),
            Self::ProcessControl(msg) => write!(f, "process control: {msg}"),
            Self::ScheduleValidation(msg) => write!(f, "schedule validation: {msg}"),
            Self::Timezone(msg) => write!(f, "timezone: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

/// `SQLite` primary result codes that signal contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        // Extended result codes carry the primary code in the low byte.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_retryable(&err) {
            Self::Db(err.to_string())
        } else {
            Self::DbRejected(err.to_string())
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
