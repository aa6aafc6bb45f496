//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator or schedule intent for a session, independent of process reality.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// No encoder should be running.
    Stopped,
    /// An encoder should be running.
    Running,
}

impl DesiredState {
    /// Stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
        }
    }
}

/// Lifecycle status for a streaming session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No encoder process.
    Idle,
    /// Start issued, waiting for the encoder to come up.
    Starting,
    /// Encoder confirmed running.
    Running,
    /// Stop issued, waiting for the encoder to go away.
    Stopping,
    /// Start failed or the encoder crashed; needs an operator reset.
    Failed,
}

impl SessionStatus {
    /// Stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Failed -> Idle` is the operator reset; nothing else leaves `Failed`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Idle | Self::Failed)
                | (Self::Failed, Self::Idle)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media the encoder reads from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamSource {
    /// Absolute path of the media file.
    pub path: String,
    /// Replay the file forever instead of ending the stream at EOF.
    #[serde(default)]
    pub looping: bool,
}

/// Platform the encoder pushes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum Destination {
    /// YouTube Live primary ingest.
    Youtube {
        /// Platform stream key.
        stream_key: String,
    },
    /// Facebook Live RTMPS ingest.
    Facebook {
        /// Platform stream key.
        stream_key: String,
    },
    /// Twitch ingest.
    Twitch {
        /// Platform stream key.
        stream_key: String,
    },
    /// Any other RTMP/RTMPS endpoint, key included in the URL.
    Custom {
        /// Full ingest URL.
        url: String,
    },
}

/// Fields supplied by the API layer when creating a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSession {
    /// Display name.
    pub name: String,
    /// Opaque owner reference from the auth layer.
    pub owner: String,
    /// Media source.
    pub source: StreamSource,
    /// Ingest destination.
    pub destination: Destination,
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Opaque owner reference.
    pub owner: String,
    /// Media source.
    pub source: StreamSource,
    /// Ingest destination.
    pub destination: Destination,
    /// Persisted intent.
    pub desired_state: DesiredState,
    /// Last observed lifecycle status.
    pub status: SessionStatus,
    /// Name of the external instance backing this session, if any.
    pub process_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a new idle session with a generated identifier.
    #[must_use]
    pub fn new(new: NewSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            owner: new.owner,
            source: new.source,
            destination: new.destination,
            desired_state: DesiredState::Stopped,
            status: SessionStatus::Idle,
            process_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        self.status.can_transition_to(next)
    }
}
