//! Process handle model owned by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an external encoder instance as reported by the control facility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Instance is active.
    Running,
    /// Instance is inactive or unknown to the facility.
    Stopped,
    /// Instance exited with an error and was not restarted.
    Failed,
}

/// Mapping from a session to the external instance that serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Owning session.
    pub session_id: String,
    /// Instance name in the external facility (e.g. a unit name).
    pub instance: String,
    /// Last observed status.
    pub status: ProcessStatus,
    /// When the supervisor started or adopted the instance.
    pub started_at: DateTime<Utc>,
}
