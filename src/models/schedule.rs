//! Schedule model: persisted rules that start or stop a session.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Rule family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fires once at an absolute instant, then disables itself.
    OneTime,
    /// Fires every day at a local time-of-day.
    Daily,
}

impl ScheduleKind {
    /// Stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Daily => "daily",
        }
    }
}

/// What a firing asks of the session registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    /// Request the session to start.
    Start,
    /// Request the session to stop.
    Stop,
}

impl ScheduleAction {
    /// Stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Time specification of a rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeSpec {
    /// Absolute instant.
    OneTime {
        /// Instant at which the schedule fires.
        at: DateTime<Utc>,
    },
    /// Local wall-clock time-of-day.
    Daily {
        /// Time-of-day in the schedule's timezone.
        time: NaiveTime,
    },
}

impl TimeSpec {
    /// Rule family of this specification.
    #[must_use]
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Self::OneTime { .. } => ScheduleKind::OneTime,
            Self::Daily { .. } => ScheduleKind::Daily,
        }
    }

    /// Encode for the `time_spec` column.
    #[must_use]
    pub fn to_stored(&self) -> String {
        match self {
            Self::OneTime { at } => at.to_rfc3339(),
            Self::Daily { time } => time.format("%H:%M:%S").to_string(),
        }
    }

    /// Decode the `time_spec` column for the given kind.
    ///
    /// Daily times accept `HH:MM` or `HH:MM:SS`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ScheduleValidation` if `raw` is malformed.
    pub fn parse(kind: ScheduleKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match kind {
            ScheduleKind::OneTime => DateTime::parse_from_rfc3339(raw)
                .map(|at| Self::OneTime {
                    at: at.with_timezone(&Utc),
                })
                .map_err(|e| AppError::ScheduleValidation(format!("invalid instant '{raw}': {e}"))),
            ScheduleKind::Daily => NaiveTime::parse_from_str(raw, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
                .map(|time| Self::Daily { time })
                .map_err(|e| {
                    AppError::ScheduleValidation(format!("invalid time of day '{raw}': {e}"))
                }),
        }
    }
}

/// Caller-supplied rule used to create or update a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRule {
    /// When to fire.
    pub time: TimeSpec,
    /// Timezone identifier: IANA name or fixed offset such as `+07:00`.
    pub timezone: String,
    /// What to do on firing.
    pub action: ScheduleAction,
    /// Whether the rule is active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Schedule domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    /// Unique record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// When to fire.
    pub time: TimeSpec,
    /// Timezone identifier.
    pub timezone: String,
    /// What to do on firing.
    pub action: ScheduleAction,
    /// Whether the rule is active.
    pub enabled: bool,
    /// Occurrence most recently committed as fired.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Next occurrence; `None` once a one-time rule has fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Construct a schedule for `session_id` with a generated identifier.
    ///
    /// `next_fire_at` is left empty; the engine computes it before persisting.
    #[must_use]
    pub fn new(session_id: String, rule: ScheduleRule) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            time: rule.time,
            timezone: rule.timezone,
            action: rule.action,
            enabled: rule.enabled,
            last_fired_at: None,
            next_fire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rule family.
    #[must_use]
    pub fn kind(&self) -> ScheduleKind {
        self.time.kind()
    }
}
