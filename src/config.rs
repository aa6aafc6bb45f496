//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::{AppError, Result};

/// Process supervisor settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Encoder binary launched for every session.
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// `systemctl` binary used for stop/status/list.
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    /// `systemd-run` binary used to launch transient units.
    #[serde(default = "default_systemd_run")]
    pub systemd_run: String,
    /// Talk to the per-user service manager (`--user`) instead of the system one.
    #[serde(default)]
    pub user_mode: bool,
    /// Prefix shared by every encoder unit; used to recognize our instances.
    ///
    /// Must be unique to this daemon on the host. Reconciliation stops
    /// units under this prefix whose name decodes to a session id that is
    /// no longer known.
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,
    /// Optional directory that every session source must live under.
    #[serde(default)]
    pub media_root: Option<PathBuf>,
    /// Upper bound for a single call against the control facility.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// Maximum number of concurrent calls against the control facility.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,
    /// Interval between crash-detection polls of running sessions.
    #[serde(default = "default_status_poll")]
    pub status_poll_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            encoder: default_encoder(),
            systemctl: default_systemctl(),
            systemd_run: default_systemd_run(),
            user_mode: false,
            unit_prefix: default_unit_prefix(),
            media_root: None,
            call_timeout_seconds: default_call_timeout(),
            max_concurrent_calls: default_max_concurrent_calls(),
            status_poll_seconds: default_status_poll(),
        }
    }
}

impl SupervisorConfig {
    /// Call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Status poll interval as a [`Duration`].
    #[must_use]
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_seconds)
    }
}

/// Schedule engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Longest the evaluation loop sleeps before re-checking.
    #[serde(default = "default_max_poll")]
    pub max_poll_seconds: u64,
    /// Maximum number of firings dispatched to the registry at once.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_poll_seconds: default_max_poll(),
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

impl SchedulerConfig {
    /// Maximum poll interval as a [`Duration`].
    #[must_use]
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_seconds)
    }
}

/// Persistence retry settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PersistenceConfig {
    /// Total attempts for a persistence call before the error surfaces.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

fn default_encoder() -> String {
    "/usr/bin/ffmpeg".into()
}

fn default_systemctl() -> String {
    "systemctl".into()
}

fn default_systemd_run() -> String {
    "systemd-run".into()
}

fn default_unit_prefix() -> String {
    "stream-session".into()
}

fn default_call_timeout() -> u64 {
    15
}

fn default_max_concurrent_calls() -> u32 {
    4
}

fn default_status_poll() -> u64 {
    10
}

fn default_max_poll() -> u64 {
    30
}

fn default_dispatch_concurrency() -> u32 {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Path of the `SQLite` database file.
    pub db_path: PathBuf,
    /// Process supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Schedule engine settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Persistence retry settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let prefix = Regex::new(r"^[a-z][a-z0-9-]*$")
            .map_err(|err| AppError::Config(format!("prefix pattern: {err}")))?;
        if !prefix.is_match(&self.supervisor.unit_prefix) {
            return Err(AppError::Config(format!(
                "unit_prefix '{}' must match [a-z][a-z0-9-]*",
                self.supervisor.unit_prefix
            )));
        }

        if self.supervisor.encoder.trim().is_empty() {
            return Err(AppError::Config("encoder must not be empty".into()));
        }

        if let Some(ref root) = self.supervisor.media_root {
            if !root.is_absolute() {
                return Err(AppError::Config(
                    "media_root must be an absolute path".into(),
                ));
            }
        }

        if self.supervisor.call_timeout_seconds == 0 {
            return Err(AppError::Config(
                "call_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.supervisor.max_concurrent_calls == 0 {
            return Err(AppError::Config(
                "max_concurrent_calls must be greater than zero".into(),
            ));
        }

        if self.supervisor.status_poll_seconds == 0 {
            return Err(AppError::Config(
                "status_poll_seconds must be greater than zero".into(),
            ));
        }

        if self.scheduler.max_poll_seconds == 0 {
            return Err(AppError::Config(
                "max_poll_seconds must be greater than zero".into(),
            ));
        }

        if self.scheduler.dispatch_concurrency == 0 {
            return Err(AppError::Config(
                "dispatch_concurrency must be greater than zero".into(),
            ));
        }

        if self.persistence.retry_attempts == 0 {
            return Err(AppError::Config(
                "retry_attempts must be at least one".into(),
            ));
        }

        Ok(())
    }
}
