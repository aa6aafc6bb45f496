//! Process-wide orchestration context.
//!
//! Built once at startup and handed to whoever needs the registry or the
//! engine. Owns the background tasks and their cancellation token.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::notify::Notifier;
use crate::persistence::db::Database;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::schedule_repo::ScheduleRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::scheduler::ScheduleEngine;
use crate::supervisor::{ProcessControl, Supervisor};
use crate::Result;

use super::monitor::spawn_status_monitor;
use super::reconciler::{reconcile, ReconcileReport};
use super::registry::SessionRegistry;

/// Owns the supervisor, registry, engine and their background tasks.
pub struct Conductor {
    config: Arc<GlobalConfig>,
    registry: Arc<SessionRegistry>,
    engine: Arc<ScheduleEngine>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Conductor {
    /// Wire every component over `db` and `control`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the supervisor cannot be built.
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        control: Arc<dyn ProcessControl>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.persistence);
        let supervisor = Arc::new(Supervisor::new(&config.supervisor, control)?);
        let registry = Arc::new(SessionRegistry::new(
            SessionRepo::new(Arc::clone(&db)),
            supervisor,
            Notifier::default(),
            retry,
        ));
        let engine = Arc::new(ScheduleEngine::new(
            ScheduleRepo::new(db),
            Arc::clone(&registry),
            &config.scheduler,
            retry,
        ));

        Ok(Self {
            config,
            registry,
            engine,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Schedule engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<ScheduleEngine> {
        &self.engine
    }

    /// State change notifier.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        self.registry.notifier()
    }

    /// Reconcile persisted state, then start the engine loop and the monitor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if reconciliation cannot read the sessions.
    pub async fn start(&self) -> Result<ReconcileReport> {
        let report = reconcile(&self.registry).await?;

        let engine = tokio::spawn(Arc::clone(&self.engine).run(self.cancel.clone()));
        let monitor = spawn_status_monitor(
            Arc::clone(&self.registry),
            self.config.supervisor.status_poll_interval(),
            self.cancel.clone(),
        );
        self.tasks.lock().await.extend([engine, monitor]);

        info!("conductor started");
        Ok(report)
    }

    /// Cancel background tasks and wait for them to finish.
    ///
    /// Encoder processes are left running; the next start reconciles them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "background task ended abnormally");
            }
        }
        info!("conductor stopped");
    }
}
