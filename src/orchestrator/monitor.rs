//! Status monitor: detects encoders that died while their session was running.
//!
//! Periodically polls every `Running` session through
//! [`SessionRegistry::refresh_status`], which moves sessions whose
//! process is gone to `Failed` and emits the notification.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::session::SessionStatus;

use super::registry::SessionRegistry;

/// Spawn the monitor loop. It runs until `cancel` fires.
#[must_use]
pub fn spawn_status_monitor(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("status monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            poll_running(&registry).await;
        }
    })
}

/// Refresh every running session once. Returns how many were marked failed.
pub async fn poll_running(registry: &SessionRegistry) -> usize {
    let running = match registry.list_by_status(SessionStatus::Running).await {
        Ok(sessions) => sessions,
        Err(err) => {
            warn!(%err, "status monitor could not list running sessions");
            return 0;
        }
    };

    let mut failed = 0;
    for session in running {
        match registry.refresh_status(&session.id).await {
            Ok(refreshed) if refreshed.status == SessionStatus::Failed => failed += 1,
            Ok(_) => debug!(session_id = %session.id, "encoder healthy"),
            Err(err) => warn!(session_id = %session.id, %err, "status refresh failed"),
        }
    }
    failed
}
