//! Schedule engine: persists rules and fires them against the registry.
//!
//! The loop sleeps until the earliest pending occurrence (capped by the
//! maximum poll interval) or until a schedule changes. On each tick due
//! schedules are claimed by committing `last_fired_at`/`next_fire_at`
//! first, and only claimed occurrences are dispatched. A crash between
//! the commit and the dispatch loses that occurrence; it is never
//! replayed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::models::schedule::{Schedule, ScheduleAction, ScheduleRule, TimeSpec};
use crate::orchestrator::registry::SessionRegistry;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::schedule_repo::{FireCommit, ScheduleRepo};
use crate::{AppError, Result};

use super::trigger::{self, Zone};

/// A claimed occurrence waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    /// Schedule that fired.
    pub schedule_id: String,
    /// Target session.
    pub session_id: String,
    /// Requested action.
    pub action: ScheduleAction,
    /// Occurrence being fired.
    pub occurrence: DateTime<Utc>,
}

/// Result of applying a firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The registry accepted the request.
    Applied,
    /// The registry refused or failed the request.
    Rejected(String),
    /// The target session no longer exists; the schedule was disabled.
    Orphaned,
}

/// Evaluates schedules and drives the session registry.
pub struct ScheduleEngine {
    schedules: ScheduleRepo,
    registry: Arc<SessionRegistry>,
    retry: RetryPolicy,
    dispatch_pool: Arc<Semaphore>,
    max_poll: Duration,
    wake: Notify,
}

impl ScheduleEngine {
    /// Create an engine over `schedules`, firing into `registry`.
    #[must_use]
    pub fn new(
        schedules: ScheduleRepo,
        registry: Arc<SessionRegistry>,
        config: &SchedulerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let permits = usize::try_from(config.dispatch_concurrency.max(1)).unwrap_or(1);
        Self {
            schedules,
            registry,
            retry,
            dispatch_pool: Arc::new(Semaphore::new(permits)),
            max_poll: config.max_poll_interval(),
            wake: Notify::new(),
        }
    }

    /// Wake the evaluation loop early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Add a rule to a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Timezone` for an unknown zone,
    /// `AppError::NotFound` if the session does not exist,
    /// `AppError::ScheduleValidation` if the rule can never fire, or
    /// `AppError::Db` if persistence fails.
    pub async fn create(&self, session_id: &str, rule: ScheduleRule) -> Result<Schedule> {
        let zone = Zone::parse(&rule.timezone)?;
        self.registry.get_session(session_id).await?;

        let now = Utc::now();
        let mut schedule = Schedule::new(session_id.to_owned(), rule);
        schedule.next_fire_at = first_fire(&schedule, &zone, now)?;

        let repo = &self.schedules;
        let pending = &schedule;
        let created = self
            .retry
            .run("create schedule", move || repo.create(pending))
            .await?;

        info!(
            schedule_id = %created.id,
            session_id,
            next_fire_at = ?created.next_fire_at,
            "schedule created"
        );
        self.wake();
        Ok(created)
    }

    /// Replace the rule of an existing schedule.
    ///
    /// The next occurrence is recomputed strictly after the later of now
    /// and the last firing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist, plus
    /// the same validation errors as [`ScheduleEngine::create`].
    pub async fn update(&self, schedule_id: &str, rule: ScheduleRule) -> Result<Schedule> {
        let zone = Zone::parse(&rule.timezone)?;
        let mut schedule = self.get(schedule_id).await?;

        schedule.time = rule.time;
        schedule.timezone = rule.timezone;
        schedule.action = rule.action;
        schedule.enabled = rule.enabled;

        let now = Utc::now();
        let after = schedule.last_fired_at.map_or(now, |last| last.max(now));
        schedule.next_fire_at = if schedule.enabled {
            first_fire(&schedule, &zone, after)?
        } else {
            trigger::next_fire_after(&schedule.time, &zone, after)
        };
        schedule.updated_at = now;

        let updated = self.store(&schedule).await?;
        info!(schedule_id, next_fire_at = ?updated.next_fire_at, "schedule updated");
        self.wake();
        Ok(updated)
    }

    /// Enable or disable a schedule.
    ///
    /// Enabling recomputes the next occurrence from now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist,
    /// `AppError::ScheduleValidation` when enabling a one-time rule whose
    /// instant has passed, or `AppError::Db` if persistence fails.
    pub async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<Schedule> {
        let mut schedule = self.get(schedule_id).await?;
        let now = Utc::now();

        if enabled {
            let zone = Zone::parse(&schedule.timezone)?;
            let after = schedule.last_fired_at.map_or(now, |last| last.max(now));
            schedule.next_fire_at = first_fire(&schedule, &zone, after)?;
        }
        schedule.enabled = enabled;
        schedule.updated_at = now;

        let updated = self.store(&schedule).await?;
        info!(schedule_id, enabled, "schedule toggled");
        self.wake();
        Ok(updated)
    }

    /// Remove a schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist, or
    /// `AppError::Db` if the delete fails.
    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        let repo = &self.schedules;
        let removed = self
            .retry
            .run("delete schedule", move || repo.delete(schedule_id))
            .await?;
        if !removed {
            return Err(AppError::NotFound(format!(
                "schedule {schedule_id} not found"
            )));
        }
        info!(schedule_id, "schedule deleted");
        Ok(())
    }

    /// Fetch one schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist, or
    /// `AppError::Db` if the lookup fails.
    pub async fn get(&self, schedule_id: &str) -> Result<Schedule> {
        let repo = &self.schedules;
        self.retry
            .run("load schedule", move || repo.get_by_id(schedule_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("schedule {schedule_id} not found")))
    }

    /// Every schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Schedule>> {
        let repo = &self.schedules;
        self.retry
            .run("list schedules", move || repo.list_all())
            .await
    }

    /// Schedules attached to one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Schedule>> {
        let repo = &self.schedules;
        self.retry
            .run("list session schedules", move || {
                repo.list_for_session(session_id)
            })
            .await
    }

    async fn store(&self, schedule: &Schedule) -> Result<Schedule> {
        let repo = &self.schedules;
        self.retry
            .run("update schedule", move || repo.update(schedule))
            .await
    }

    /// Claim every occurrence due at `now`.
    ///
    /// Each claim is committed before it is returned; a schedule whose
    /// stored `next_fire_at` moved since it was read is skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if due schedules cannot be listed.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Firing>> {
        let repo = &self.schedules;
        let due = self
            .retry
            .run("list due schedules", move || repo.list_due(now))
            .await?;

        let mut firings = Vec::with_capacity(due.len());
        for schedule in due {
            let Some(expected) = schedule.next_fire_at else {
                continue;
            };

            let (occurrence, commit) = match plan_firing(&schedule, expected, now) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(schedule_id = %schedule.id, %err, "disabling schedule with unusable rule");
                    if let Err(err) = self.schedules.disable(&schedule.id).await {
                        warn!(schedule_id = %schedule.id, %err, "failed to disable schedule");
                    }
                    continue;
                }
            };

            let id = schedule.id.as_str();
            let claimed = self
                .retry
                .run("commit firing", move || repo.commit_fire(id, expected, commit))
                .await;

            match claimed {
                Ok(true) => firings.push(Firing {
                    schedule_id: schedule.id.clone(),
                    session_id: schedule.session_id.clone(),
                    action: schedule.action,
                    occurrence,
                }),
                Ok(false) => debug!(schedule_id = id, "occurrence already claimed"),
                Err(err) => warn!(schedule_id = id, %err, "could not commit firing, skipping"),
            }
        }
        Ok(firings)
    }

    /// Apply a claimed firing on a dispatch task.
    #[must_use]
    pub fn dispatch(&self, firing: Firing) -> JoinHandle<FireOutcome> {
        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.dispatch_pool);
        let schedules = self.schedules.clone();
        let span = info_span!(
            "schedule_fire",
            schedule_id = %firing.schedule_id,
            session_id = %firing.session_id,
            action = firing.action.as_str(),
        );

        tokio::spawn(
            async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return FireOutcome::Rejected("dispatch pool closed".into());
                };

                let result = match firing.action {
                    ScheduleAction::Start => registry
                        .request_start(&firing.session_id)
                        .await
                        .map(|_| ()),
                    ScheduleAction::Stop => registry
                        .request_stop(&firing.session_id)
                        .await
                        .map(|_| ()),
                };

                match result {
                    Ok(()) => {
                        info!(occurrence = %firing.occurrence, "schedule fired");
                        FireOutcome::Applied
                    }
                    Err(AppError::NotFound(msg)) => {
                        warn!(%msg, "target session missing, disabling schedule");
                        if let Err(err) = schedules.disable(&firing.schedule_id).await {
                            warn!(%err, "failed to disable orphaned schedule");
                        }
                        FireOutcome::Orphaned
                    }
                    Err(err) => {
                        warn!(%err, "schedule firing failed");
                        FireOutcome::Rejected(err.to_string())
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Claim and dispatch everything due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<FireOutcome>> {
        match self.claim_due(now).await {
            Ok(firings) => firings.into_iter().map(|f| self.dispatch(f)).collect(),
            Err(err) => {
                warn!(%err, "schedule evaluation failed");
                Vec::new()
            }
        }
    }

    /// How long the loop may sleep after evaluating at `now`.
    pub async fn next_wake_delay(&self, now: DateTime<Utc>) -> Duration {
        let repo = &self.schedules;
        match self
            .retry
            .run("earliest pending", move || repo.earliest_pending())
            .await
        {
            Ok(Some(at)) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_poll),
            Ok(None) => self.max_poll,
            Err(err) => {
                warn!(%err, "could not read earliest pending occurrence");
                self.max_poll
            }
        }
    }

    /// Evaluation loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("schedule engine started");
        loop {
            // Dispatch tasks run detached from the loop.
            drop(self.tick(Utc::now()).await);

            let delay = self.next_wake_delay(Utc::now()).await;
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("schedule engine shutting down");
                    break;
                }
                () = tokio::time::sleep(delay) => {}
                () = self.wake.notified() => debug!("schedule engine woken"),
            }
        }
    }
}

/// Next occurrence for a rule that must be able to fire.
fn first_fire(
    schedule: &Schedule,
    zone: &Zone,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger::next_fire_after(&schedule.time, zone, after) {
        Some(next) => Ok(Some(next)),
        None => match schedule.time {
            TimeSpec::OneTime { at } => Err(AppError::ScheduleValidation(format!(
                "one-time instant {at} is not in the future"
            ))),
            TimeSpec::Daily { time } => Err(AppError::ScheduleValidation(format!(
                "daily time {time} has no occurrence in {}",
                schedule.timezone
            ))),
        },
    }
}

/// Occurrence to fire and the commit that records it.
fn plan_firing(
    schedule: &Schedule,
    expected: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, FireCommit)> {
    match schedule.time {
        TimeSpec::OneTime { at } => Ok((
            at,
            FireCommit {
                last_fired_at: at,
                next_fire_at: None,
                enabled: false,
            },
        )),
        TimeSpec::Daily { time } => {
            let zone = Zone::parse(&schedule.timezone)?;
            // Missed occurrences collapse into the latest one.
            let occurrence = trigger::latest_occurrence(time, &zone, now)
                .map_or(expected, |latest| latest.max(expected));
            let next = trigger::next_occurrence(time, &zone, occurrence).ok_or_else(|| {
                AppError::ScheduleValidation(format!(
                    "daily time {time} has no occurrence after {occurrence}"
                ))
            })?;
            Ok((
                occurrence,
                FireCommit {
                    last_fired_at: occurrence,
                    next_fire_at: Some(next),
                    enabled: true,
                },
            ))
        }
    }
}
