//! `systemd` implementation of [`ProcessControl`].
//!
//! Encoders run as transient service units launched with `systemd-run`.
//! The argv is passed after `--`, so no shell ever parses it. Crash
//! restarts are left to the service manager (`Restart=on-failure`).

use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SupervisorConfig;
use crate::models::process::ProcessStatus;
use crate::{AppError, Result};

use super::naming::UNIT_SUFFIX;
use super::{ControlFuture, ProcessControl};

/// `systemctl stop` exit code for a unit that is not loaded.
const EXIT_UNIT_NOT_LOADED: i32 = 5;

/// Process control through the host's `systemd` service manager.
#[derive(Debug, Clone)]
pub struct SystemdControl {
    systemctl: String,
    systemd_run: String,
    user_mode: bool,
}

impl SystemdControl {
    /// Build from supervisor configuration.
    #[must_use]
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            systemctl: config.systemctl.clone(),
            systemd_run: config.systemd_run.clone(),
            user_mode: config.user_mode,
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if self.user_mode {
            cmd.arg("--user");
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(mut cmd: Command, what: &str) -> Result<Output> {
        cmd.output()
            .await
            .map_err(|err| AppError::ProcessControl(format!("{what}: failed to execute: {err}")))
    }

    async fn start_unit(&self, unit: &str, argv: &[String]) -> Result<()> {
        let service = format!("{unit}{UNIT_SUFFIX}");

        // A failed unit with the same name blocks a new transient unit.
        let mut reset = self.command(&self.systemctl);
        reset.arg("reset-failed").arg(&service);
        if let Ok(out) = Self::output(reset, "reset-failed").await {
            debug!(unit, code = ?out.status.code(), "reset-failed issued");
        }

        let mut cmd = self.command(&self.systemd_run);
        cmd.arg(format!("--unit={service}"))
            .arg("--collect")
            .arg("--quiet")
            .arg("--property=Restart=on-failure")
            .arg("--property=RestartSec=5")
            .arg("--")
            .args(argv);

        let out = Self::output(cmd, "systemd-run").await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(AppError::ProcessStart(format!(
                "systemd-run {service} exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    async fn stop_unit(&self, unit: &str) -> Result<()> {
        let service = format!("{unit}{UNIT_SUFFIX}");
        let mut cmd = self.command(&self.systemctl);
        cmd.arg("stop").arg(&service);

        let out = Self::output(cmd, "systemctl stop").await?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(EXIT_UNIT_NOT_LOADED) => {
                debug!(unit, "stop requested for unit that is not loaded");
                Ok(())
            }
            code => Err(AppError::ProcessControl(format!(
                "systemctl stop {service} exited with {code:?}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
        }
    }

    async fn unit_status(&self, unit: &str) -> Result<ProcessStatus> {
        let service = format!("{unit}{UNIT_SUFFIX}");
        let mut cmd = self.command(&self.systemctl);
        cmd.arg("is-active").arg(&service);

        // `is-active` exits non-zero for anything but active; stdout is authoritative.
        let out = Self::output(cmd, "systemctl is-active").await?;
        let state = String::from_utf8_lossy(&out.stdout).trim().to_owned();
        Ok(parse_active_state(&state))
    }

    async fn list_units(&self, prefix: &str) -> Result<Vec<String>> {
        let mut cmd = self.command(&self.systemctl);
        cmd.arg("list-units")
            .arg("--type=service")
            .arg("--state=active,activating,reloading,deactivating")
            .arg("--no-legend")
            .arg("--plain")
            .arg(format!("{prefix}-*{UNIT_SUFFIX}"));

        let out = Self::output(cmd, "systemctl list-units").await?;
        if !out.status.success() {
            return Err(AppError::ProcessControl(format!(
                "systemctl list-units exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(parse_unit_list(&stdout))
    }
}

/// Map `systemctl is-active` output to a process status.
#[must_use]
pub fn parse_active_state(state: &str) -> ProcessStatus {
    match state {
        "active" | "activating" | "reloading" | "deactivating" => ProcessStatus::Running,
        "failed" => ProcessStatus::Failed,
        "inactive" | "unknown" | "" => ProcessStatus::Stopped,
        other => {
            warn!(state = other, "unrecognized unit state, treating as stopped");
            ProcessStatus::Stopped
        }
    }
}

/// Extract live unit names (without suffix) from `list-units --plain --no-legend`.
///
/// Lines are `UNIT LOAD ACTIVE SUB DESCRIPTION`; a unit counts as live
/// when its ACTIVE column maps to [`ProcessStatus::Running`], so a unit
/// waiting out its restart delay (`activating`) is still reported.
#[must_use]
pub fn parse_unit_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let unit = columns.next()?;
            let active = columns.nth(1)?;
            (parse_active_state(active) == ProcessStatus::Running).then_some(unit)
        })
        .map(|unit| unit.strip_suffix(UNIT_SUFFIX).unwrap_or(unit).to_owned())
        .collect()
}

impl ProcessControl for SystemdControl {
    fn start<'a>(&'a self, unit: &'a str, argv: &'a [String]) -> ControlFuture<'a, ()> {
        Box::pin(self.start_unit(unit, argv))
    }

    fn stop<'a>(&'a self, unit: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(self.stop_unit(unit))
    }

    fn status<'a>(&'a self, unit: &'a str) -> ControlFuture<'a, ProcessStatus> {
        Box::pin(self.unit_status(unit))
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ControlFuture<'a, Vec<String>> {
        Box::pin(self.list_units(prefix))
    }
}
