//! Startup reconciliation of persisted intent with live processes.
//!
//! Runs once before the schedule engine starts ticking. Each session is
//! handled under its transition lock and receives at most one restart
//! attempt; there are no retry loops here.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::models::process::ProcessStatus;
use crate::models::session::{DesiredState, Session, SessionStatus};
use crate::Result;

use super::registry::SessionRegistry;

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Running processes adopted for sessions that want to run.
    pub adopted: usize,
    /// Sessions whose missing process was started again.
    pub restarted: usize,
    /// Processes stopped because their session wants to be stopped.
    pub stopped: usize,
    /// Sessions left `Failed`.
    pub failed: usize,
}

/// Align every session's status with what the supervisor observes.
///
/// # Errors
///
/// Returns `AppError::Db` if the session list cannot be read. Per-session
/// failures are logged and counted in [`ReconcileReport::failed`].
pub async fn reconcile(registry: &SessionRegistry) -> Result<ReconcileReport> {
    let span = info_span!("reconcile");
    async {
        let sessions = registry.list_sessions().await?;
        let observed = observe(registry, &sessions).await;

        let mut report = ReconcileReport::default();
        for session in &sessions {
            let Some(&status) = observed.get(&session.id) else {
                warn!(session_id = %session.id, "process status unknown, skipping");
                report.failed += 1;
                continue;
            };
            let present = status == ProcessStatus::Running;
            if let Err(err) = reconcile_session(registry, &session.id, present, &mut report).await
            {
                warn!(session_id = %session.id, %err, "session reconciliation failed");
                report.failed += 1;
            }
        }

        info!(
            adopted = report.adopted,
            restarted = report.restarted,
            stopped = report.stopped,
            failed = report.failed,
            "reconciliation complete"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Live status for every session, by listing or by querying one at a time.
async fn observe(
    registry: &SessionRegistry,
    sessions: &[Session],
) -> HashMap<String, ProcessStatus> {
    let supervisor = registry.supervisor();
    let known: HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();

    match supervisor.reconcile_all(&known).await {
        Ok(observed) => observed.into_iter().collect(),
        Err(err) => {
            warn!(%err, "instance listing failed, querying sessions individually");
            let mut observed = HashMap::new();
            for id in known {
                match supervisor.status(&id).await {
                    Ok(status) => {
                        if status == ProcessStatus::Running {
                            supervisor.adopt(&id).await;
                        }
                        observed.insert(id, status);
                    }
                    Err(err) => warn!(session_id = %id, %err, "status query failed"),
                }
            }
            observed
        }
    }
}

async fn reconcile_session(
    registry: &SessionRegistry,
    session_id: &str,
    present: bool,
    report: &mut ReconcileReport,
) -> Result<()> {
    let (_guard, session) = registry.lock_session(session_id).await?;

    match (session.desired_state, present) {
        (DesiredState::Running, true) => {
            converge_running(registry, &session).await?;
            report.adopted += 1;
        }
        (DesiredState::Running, false) => {
            if session.status == SessionStatus::Failed {
                warn!(session_id, "session is failed, waiting for operator reset");
                report.failed += 1;
                return Ok(());
            }

            if matches!(
                session.status,
                SessionStatus::Starting | SessionStatus::Running | SessionStatus::Stopping
            ) {
                warn!(session_id, status = %session.status, "encoder missing, marking failed");
                registry
                    .transition(session_id, SessionStatus::Failed, None)
                    .await?;
                registry
                    .transition(session_id, SessionStatus::Idle, None)
                    .await?;
            }

            let idle = registry.get_session(session_id).await?;
            match registry.start_locked(&idle).await {
                Ok(_) => report.restarted += 1,
                Err(err) => {
                    warn!(session_id, %err, "restart after recovery failed");
                    report.failed += 1;
                }
            }
        }
        (DesiredState::Stopped, true) => {
            registry.supervisor().stop(session_id).await?;
            converge_idle(registry, &session).await?;
            report.stopped += 1;
        }
        (DesiredState::Stopped, false) => {
            converge_idle(registry, &session).await?;
            if session.status == SessionStatus::Failed {
                report.failed += 1;
            }
        }
    }
    Ok(())
}

/// Walk the state machine to `Running` for a session whose process is live.
async fn converge_running(registry: &SessionRegistry, session: &Session) -> Result<()> {
    let handle = registry.supervisor().adopt(&session.id).await;
    let instance = Some(handle.instance.as_str());

    let path: &[SessionStatus] = match session.status {
        SessionStatus::Running => &[],
        SessionStatus::Starting => &[SessionStatus::Running],
        SessionStatus::Idle => &[SessionStatus::Starting, SessionStatus::Running],
        SessionStatus::Failed => &[
            SessionStatus::Idle,
            SessionStatus::Starting,
            SessionStatus::Running,
        ],
        SessionStatus::Stopping => &[
            SessionStatus::Failed,
            SessionStatus::Idle,
            SessionStatus::Starting,
            SessionStatus::Running,
        ],
    };

    for &next in path {
        registry.transition(&session.id, next, instance).await?;
    }
    if !path.is_empty() {
        info!(session_id = %session.id, unit = %handle.instance, "adopted running encoder");
    }
    Ok(())
}

/// Walk the state machine to `Idle` for a session with no process.
///
/// `Failed` is left alone; only an operator reset clears it.
async fn converge_idle(registry: &SessionRegistry, session: &Session) -> Result<()> {
    let path: &[SessionStatus] = match session.status {
        SessionStatus::Idle | SessionStatus::Failed => &[],
        SessionStatus::Running => &[SessionStatus::Stopping, SessionStatus::Idle],
        SessionStatus::Starting => &[SessionStatus::Failed, SessionStatus::Idle],
        SessionStatus::Stopping => &[SessionStatus::Idle],
    };

    for &next in path {
        registry.transition(&session.id, next, None).await?;
    }
    Ok(())
}
