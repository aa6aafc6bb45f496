//! Session registry: the per-session state machine.
//!
//! Every operation that changes a session's status runs under that
//! session's transition lock, so concurrent start/stop requests for the
//! same session are totally ordered while different sessions proceed in
//! parallel. Status changes are persisted before a notification is
//! emitted and before the operation reports success.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, info_span, warn, Instrument};

use crate::models::process::{ProcessHandle, ProcessStatus};
use crate::models::session::{DesiredState, NewSession, Session, SessionStatus};
use crate::notify::Notifier;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::session_repo::SessionRepo;
use crate::supervisor::Supervisor;
use crate::{AppError, Result};

/// Owns session lifecycle and drives the supervisor.
pub struct SessionRegistry {
    sessions: SessionRepo,
    supervisor: Arc<Supervisor>,
    notifier: Notifier,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    /// Create a registry over `sessions`, driving `supervisor`.
    #[must_use]
    pub fn new(
        sessions: SessionRepo,
        supervisor: Arc<Supervisor>,
        notifier: Notifier,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions,
            supervisor,
            notifier,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Supervisor driven by this registry.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Notifier that receives every committed transition.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Acquire the transition lock for `session_id`.
    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(session_id.to_owned()).or_default())
        };
        entry.lock_owned().await
    }

    /// Acquire the transition lock and load the session under it.
    ///
    /// An unknown id leaves no lock entry behind.
    pub(crate) async fn lock_session(
        &self,
        session_id: &str,
    ) -> Result<(OwnedMutexGuard<()>, Session)> {
        let guard = self.lock(session_id).await;
        match self.get_session(session_id).await {
            Ok(session) => Ok((guard, session)),
            Err(err) => {
                drop(guard);
                if matches!(err, AppError::NotFound(_)) {
                    self.forget_lock(session_id).await;
                }
                Err(err)
            }
        }
    }

    /// Drop the lock entry for `session_id` unless another task holds or awaits it.
    async fn forget_lock(&self, session_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(session_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(session_id);
        }
    }

    /// Number of sessions with a transition lock entry.
    pub async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Register a new idle session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the name is empty or the source or
    /// destination is invalid, or `AppError::Db` if persistence fails.
    pub async fn create_session(&self, new: NewSession) -> Result<Session> {
        if new.name.trim().is_empty() {
            return Err(AppError::Config("session name must not be empty".into()));
        }
        self.supervisor.validate(&new.source, &new.destination)?;

        let session = Session::new(new);
        let repo = &self.sessions;
        let pending = &session;
        let created = self
            .retry
            .run("create session", move || repo.create(pending))
            .await?;

        info!(session_id = %created.id, name = %created.name, "session created");
        Ok(created)
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the lookup fails.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let repo = &self.sessions;
        self.retry
            .run("load session", move || repo.get_by_id(session_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// List every session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let repo = &self.sessions;
        self.retry
            .run("list sessions", move || repo.list_all())
            .await
    }

    /// List sessions currently in `status`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let repo = &self.sessions;
        self.retry
            .run("list sessions by status", move || repo.list_by_status(status))
            .await
    }

    /// Ask for the session's encoder to run.
    ///
    /// A running session returns its current handle without side effects.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::InvalidTransition` if the session is failed or mid-transition,
    /// and `AppError::ProcessStart` if the encoder does not come up (the
    /// session is left `Failed`).
    pub async fn request_start(&self, session_id: &str) -> Result<ProcessHandle> {
        let span = info_span!("request_start", session_id);
        async {
            let (_guard, session) = self.lock_session(session_id).await?;

            match session.status {
                SessionStatus::Running => match self.supervisor.handle(session_id).await {
                    Ok(handle) => Ok(handle),
                    Err(AppError::ProcessNotFound(_)) => Ok(self.supervisor.adopt(session_id).await),
                    Err(err) => Err(err),
                },
                SessionStatus::Idle => self.start_locked(&session).await,
                SessionStatus::Failed => Err(AppError::InvalidTransition(format!(
                    "session {session_id} is failed; reset it before starting"
                ))),
                status @ (SessionStatus::Starting | SessionStatus::Stopping) => {
                    Err(AppError::InvalidTransition(format!(
                        "session {session_id} is {status}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Start an idle session. Caller holds the session lock.
    pub(crate) async fn start_locked(&self, session: &Session) -> Result<ProcessHandle> {
        let session_id = session.id.as_str();
        self.set_desired(session_id, DesiredState::Running).await?;
        let starting = self
            .transition(session_id, SessionStatus::Starting, None)
            .await?;

        match self.supervisor.start(&starting).await {
            Ok(handle) => {
                if let Err(err) = self
                    .transition(session_id, SessionStatus::Running, Some(&handle.instance))
                    .await
                {
                    warn!(session_id, %err, "could not record running state, stopping encoder");
                    if let Err(stop_err) = self.supervisor.stop(session_id).await {
                        warn!(session_id, %stop_err, "cleanup stop failed");
                    }
                    self.mark_failed(session_id).await;
                    return Err(err);
                }
                Ok(handle)
            }
            Err(err) => {
                warn!(session_id, %err, "encoder failed to start");
                self.transition(session_id, SessionStatus::Failed, None)
                    .await?;
                Err(err)
            }
        }
    }

    /// Ask for the session's encoder to stop.
    ///
    /// Idle and failed sessions only record the stopped intent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::InvalidTransition` if the session is mid-transition, and
    /// `AppError::ProcessControl` if the stop call fails (the session is
    /// left `Failed`).
    pub async fn request_stop(&self, session_id: &str) -> Result<Session> {
        let span = info_span!("request_stop", session_id);
        async {
            let (_guard, session) = self.lock_session(session_id).await?;

            match session.status {
                SessionStatus::Idle | SessionStatus::Failed => {
                    if session.desired_state == DesiredState::Stopped {
                        Ok(session)
                    } else {
                        self.set_desired(session_id, DesiredState::Stopped).await
                    }
                }
                SessionStatus::Running => self.stop_locked(&session).await,
                status @ (SessionStatus::Starting | SessionStatus::Stopping) => {
                    Err(AppError::InvalidTransition(format!(
                        "session {session_id} is {status}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Stop a running session. Caller holds the session lock.
    pub(crate) async fn stop_locked(&self, session: &Session) -> Result<Session> {
        let session_id = session.id.as_str();
        self.set_desired(session_id, DesiredState::Stopped).await?;
        self.transition(
            session_id,
            SessionStatus::Stopping,
            session.process_ref.as_deref(),
        )
        .await?;

        if let Err(err) = self.supervisor.stop(session_id).await {
            warn!(session_id, %err, "encoder failed to stop");
            self.transition(
                session_id,
                SessionStatus::Failed,
                session.process_ref.as_deref(),
            )
            .await?;
            return Err(err);
        }

        match self.transition(session_id, SessionStatus::Idle, None).await {
            Ok(idle) => Ok(idle),
            Err(err) => {
                warn!(session_id, %err, "could not record idle state");
                self.mark_failed(session_id).await;
                Err(err)
            }
        }
    }

    /// Best-effort move to `Failed` so an operator reset can recover the session.
    async fn mark_failed(&self, session_id: &str) {
        if let Err(err) = self
            .transition(session_id, SessionStatus::Failed, None)
            .await
        {
            warn!(session_id, %err, "could not record failed state");
        }
    }

    /// Clear a failed session back to idle with a stopped intent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or
    /// `AppError::InvalidTransition` if the session is not failed.
    pub async fn reset(&self, session_id: &str) -> Result<Session> {
        let span = info_span!("reset_session", session_id);
        async {
            let (_guard, session) = self.lock_session(session_id).await?;
            if session.status != SessionStatus::Failed {
                return Err(AppError::InvalidTransition(format!(
                    "session {session_id} is {}, only failed sessions can be reset",
                    session.status
                )));
            }

            if let Err(err) = self.supervisor.stop(session_id).await {
                warn!(session_id, %err, "stop during reset failed");
            }
            self.set_desired(session_id, DesiredState::Stopped).await?;
            self.transition(session_id, SessionStatus::Idle, None).await
        }
        .instrument(span)
        .await
    }

    /// Compare a running session with the live process status.
    ///
    /// A running session whose encoder is gone becomes `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or
    /// `AppError::ProcessControl` if the status cannot be queried.
    pub async fn refresh_status(&self, session_id: &str) -> Result<Session> {
        let (_guard, session) = self.lock_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Ok(session);
        }

        let live = self.supervisor.status(session_id).await?;
        if live == ProcessStatus::Running {
            return Ok(session);
        }

        warn!(session_id, ?live, "encoder no longer running");
        self.transition(
            session_id,
            SessionStatus::Failed,
            session.process_ref.as_deref(),
        )
        .await
    }

    /// Stop a session's encoder and remove the session with its schedules.
    ///
    /// Returns the number of schedules removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::ProcessControl` if the encoder cannot be confirmed stopped
    /// (nothing is deleted), or `AppError::Db` if the delete fails.
    pub async fn delete(&self, session_id: &str) -> Result<u64> {
        let span = info_span!("delete_session", session_id);
        async {
            let (guard, session) = self.lock_session(session_id).await?;

            if session.status == SessionStatus::Running {
                self.stop_locked(&session).await?;
            } else {
                self.supervisor.stop(session_id).await?;
            }

            let repo = &self.sessions;
            let removed = self
                .retry
                .run("delete session", move || {
                    repo.delete_with_schedules(session_id)
                })
                .await?;

            drop(guard);
            self.forget_lock(session_id).await;
            info!(schedules = removed, "session deleted");
            Ok(removed)
        }
        .instrument(span)
        .await
    }

    /// Persist a status change, then notify.
    pub(crate) async fn transition(
        &self,
        session_id: &str,
        next: SessionStatus,
        process_ref: Option<&str>,
    ) -> Result<Session> {
        let repo = &self.sessions;
        let session = self
            .retry
            .run("update session status", move || {
                repo.update_status(session_id, next, process_ref)
            })
            .await?;

        self.notifier.emit(session_id, next, session.updated_at);
        info!(session_id, status = %next, "session status changed");
        Ok(session)
    }

    async fn set_desired(&self, session_id: &str, desired: DesiredState) -> Result<Session> {
        let repo = &self.sessions;
        self.retry
            .run("set desired state", move || {
                repo.set_desired_state(session_id, desired)
            })
            .await
    }
}
