//! Process supervisor: owns the mapping from sessions to encoder processes.
//!
//! The [`ProcessControl`] trait decouples the supervisor from the host
//! service manager. Production uses [`systemd::SystemdControl`]; tests
//! substitute an in-memory implementation. Every call through the trait
//! holds a permit from a bounded pool and is subject to a timeout, so a
//! hung service manager cannot stall the orchestrator indefinitely.

pub mod command;
pub mod naming;
pub mod systemd;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::models::process::{ProcessHandle, ProcessStatus};
use crate::models::session::{Destination, Session, StreamSource};
use crate::{AppError, Result};

use self::command::CommandBuilder;
use self::naming::UnitNaming;

/// Boxed future returned by [`ProcessControl`] methods.
pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Host facility that runs, stops, and reports on named processes.
///
/// `unit` is always an instance name produced by [`UnitNaming`], without
/// the service manager's suffix.
pub trait ProcessControl: Send + Sync {
    /// Launch `argv` as the named instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessStart` if the facility refuses the unit.
    fn start<'a>(&'a self, unit: &'a str, argv: &'a [String]) -> ControlFuture<'a, ()>;

    /// Stop the named instance. Stopping an unknown instance succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the facility reports a failure.
    fn stop<'a>(&'a self, unit: &'a str) -> ControlFuture<'a, ()>;

    /// Current status of the named instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the facility cannot be queried.
    fn status<'a>(&'a self, unit: &'a str) -> ControlFuture<'a, ProcessStatus>;

    /// Names of running instances whose name starts with `prefix-`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the facility cannot be queried.
    fn list<'a>(&'a self, prefix: &'a str) -> ControlFuture<'a, Vec<String>>;
}

/// Starts, stops, and observes encoder processes for sessions.
///
/// At most one process exists per session: the instance name is a pure
/// function of the session id, and `start` returns the tracked handle
/// instead of launching a second instance.
pub struct Supervisor {
    control: Arc<dyn ProcessControl>,
    naming: UnitNaming,
    commands: CommandBuilder,
    call_timeout: Duration,
    pool: Arc<Semaphore>,
    handles: Mutex<HashMap<String, ProcessHandle>>,
}

impl Supervisor {
    /// Build a supervisor around a process control implementation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the command builder cannot be created.
    pub fn new(config: &SupervisorConfig, control: Arc<dyn ProcessControl>) -> Result<Self> {
        let commands = CommandBuilder::new(config.encoder.clone(), config.media_root.clone())?;
        let permits = usize::try_from(config.max_concurrent_calls.max(1)).unwrap_or(1);
        Ok(Self {
            control,
            naming: UnitNaming::new(config.unit_prefix.clone()),
            commands,
            call_timeout: config.call_timeout(),
            pool: Arc::new(Semaphore::new(permits)),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Naming convention in use.
    #[must_use]
    pub fn naming(&self) -> &UnitNaming {
        &self.naming
    }

    /// Validate a session's source and destination.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid field.
    pub fn validate(&self, source: &StreamSource, destination: &Destination) -> Result<()> {
        self.commands.validate(source, destination)
    }

    /// Run a control call under a pool permit and the call timeout.
    async fn call<T>(&self, what: &str, fut: ControlFuture<'_, T>) -> Result<T> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| AppError::ProcessControl("control pool closed".into()))?;
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ProcessControl(format!(
                "{what} timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Start the encoder for `session`, or return the existing handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessStart` if the process cannot be launched or
    /// does not report running afterwards, and `AppError::Config` if the
    /// session's source or destination is invalid.
    pub async fn start(&self, session: &Session) -> Result<ProcessHandle> {
        let instance = self.naming.instance_name(&session.id);
        let span = info_span!("supervisor_start", session_id = %session.id, %instance);

        async {
            if let Some(existing) = self.tracked(&session.id).await {
                let live = self
                    .call("status", self.control.status(&existing.instance))
                    .await?;
                if live == ProcessStatus::Running {
                    debug!("process already tracked and running");
                    return Ok(existing);
                }
            }

            let argv = self.commands.build(&session.source, &session.destination)?;

            let launched: Result<()> = async {
                self.call("start", self.control.start(&instance, &argv))
                    .await?;
                match self.call("status", self.control.status(&instance)).await? {
                    ProcessStatus::Running => Ok(()),
                    other => Err(AppError::ProcessStart(format!(
                        "{instance} reported {other:?} after start"
                    ))),
                }
            }
            .await;

            if let Err(err) = launched {
                if let Err(stop_err) = self.call("stop", self.control.stop(&instance)).await {
                    warn!(%stop_err, "cleanup stop after failed start also failed");
                }
                self.handles.lock().await.remove(&session.id);
                return Err(match err {
                    AppError::ProcessStart(msg) => AppError::ProcessStart(msg),
                    other => AppError::ProcessStart(format!("{instance}: {other}")),
                });
            }

            let handle = ProcessHandle {
                session_id: session.id.clone(),
                instance: instance.clone(),
                status: ProcessStatus::Running,
                started_at: Utc::now(),
            };
            self.handles
                .lock()
                .await
                .insert(session.id.clone(), handle.clone());
            info!("encoder process started");
            Ok(handle)
        }
        .instrument(span)
        .await
    }

    /// Stop the encoder for `session_id`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the stop call fails or the
    /// process still reports running afterwards.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let instance = self.naming.instance_name(session_id);
        self.call("stop", self.control.stop(&instance)).await?;

        let status = self.call("status", self.control.status(&instance)).await?;
        if status == ProcessStatus::Running {
            return Err(AppError::ProcessControl(format!(
                "{instance} still running after stop"
            )));
        }

        if self.handles.lock().await.remove(session_id).is_some() {
            info!(session_id, %instance, "encoder process stopped");
        }
        Ok(())
    }

    /// Live status of the process for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the facility cannot be queried.
    pub async fn status(&self, session_id: &str) -> Result<ProcessStatus> {
        let instance = self.naming.instance_name(session_id);
        let status = self.call("status", self.control.status(&instance)).await?;

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(session_id) {
            handle.status = status;
        }
        Ok(status)
    }

    /// Tracked handle for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessNotFound` if the session is not tracked.
    pub async fn handle(&self, session_id: &str) -> Result<ProcessHandle> {
        self.tracked(session_id)
            .await
            .ok_or_else(|| AppError::ProcessNotFound(format!("session {session_id}")))
    }

    async fn tracked(&self, session_id: &str) -> Option<ProcessHandle> {
        self.handles.lock().await.get(session_id).cloned()
    }

    /// Begin tracking a process that is already running for `session_id`.
    pub async fn adopt(&self, session_id: &str) -> ProcessHandle {
        let handle = ProcessHandle {
            session_id: session_id.to_owned(),
            instance: self.naming.instance_name(session_id),
            status: ProcessStatus::Running,
            started_at: Utc::now(),
        };
        self.handles
            .lock()
            .await
            .entry(session_id.to_owned())
            .or_insert(handle)
            .clone()
    }

    /// Compare running instances with the set of known sessions.
    ///
    /// Running instances belonging to a known session are adopted. Running
    /// instances naming a session id that is no longer known are stopped. Returns
    /// the observed status for every id in `known`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessControl` if the instance list cannot be read.
    pub async fn reconcile_all(
        &self,
        known: &HashSet<String>,
    ) -> Result<Vec<(String, ProcessStatus)>> {
        let units = self
            .call("list", self.control.list(self.naming.prefix()))
            .await?;

        let mut running = HashSet::new();
        for unit in units {
            match self.naming.session_id(&unit) {
                Some(id) if known.contains(&id) => {
                    self.adopt(&id).await;
                    running.insert(id);
                }
                // Session ids are UUIDs; anything else under the prefix is not ours.
                Some(id) if Uuid::parse_str(&id).is_err() => {
                    debug!(%unit, "ignoring unit that does not name a session");
                }
                Some(id) => {
                    warn!(session_id = %id, %unit, "stopping orphan encoder process");
                    if let Err(err) = self.call("stop", self.control.stop(&unit)).await {
                        warn!(%err, %unit, "failed to stop orphan process");
                    }
                }
                None => debug!(%unit, "ignoring unit outside naming convention"),
            }
        }

        let mut handles = self.handles.lock().await;
        handles.retain(|id, _| running.contains(id));
        drop(handles);

        let mut observed: Vec<(String, ProcessStatus)> = known
            .iter()
            .map(|id| {
                let status = if running.contains(id) {
                    ProcessStatus::Running
                } else {
                    ProcessStatus::Stopped
                };
                (id.clone(), status)
            })
            .collect();
        observed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(observed)
    }
}
