//! Session state change notifications.
//!
//! Every committed status transition is published on a broadcast channel.
//! Delivery is best-effort: slow subscribers lag and lose the oldest
//! messages, and publishing with no subscribers is not an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::session::SessionStatus;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// A committed session status transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateChange {
    /// Session whose status changed.
    pub session_id: String,
    /// Status after the transition.
    pub new_state: SessionStatus,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
}

/// Publisher side of the state change channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<StateChange>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    /// Create a notifier with room for `capacity` undelivered messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    /// Publish a transition.
    pub fn emit(&self, session_id: &str, new_state: SessionStatus, timestamp: DateTime<Utc>) {
        // No receivers is fine.
        let _ = self.tx.send(StateChange {
            session_id: session_id.to_owned(),
            new_state,
            timestamp,
        });
    }
}
