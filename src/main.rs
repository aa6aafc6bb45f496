#![forbid(unsafe_code)]

//! `stream-conductor`: stream session and schedule orchestration daemon.
//!
//! Loads configuration, opens the database, reconciles sessions with the
//! service manager, then runs the schedule engine and status monitor
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stream_conductor::notify::Notifier;
use stream_conductor::orchestrator::Conductor;
use stream_conductor::persistence::db;
use stream_conductor::supervisor::systemd::SystemdControl;
use stream_conductor::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stream-conductor", about = "Stream session orchestration daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stream-conductor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    info!(config = %args.config.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.db_path).await?);
    info!(db = %config.db_path.display(), "database connected");

    // ── Build orchestration context ─────────────────────
    let control = Arc::new(SystemdControl::new(&config.supervisor));
    let conductor = Conductor::new(Arc::clone(&config), pool, control)?;
    let log_task = spawn_state_log(conductor.notifier());

    let report = conductor.start().await?;
    info!(
        adopted = report.adopted,
        restarted = report.restarted,
        stopped = report.stopped,
        failed = report.failed,
        "stream-conductor ready"
    );

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    conductor.shutdown().await;
    log_task.abort();
    info!("stream-conductor shut down");

    Ok(())
}

/// Log every committed state change at info level.
fn spawn_state_log(notifier: &Notifier) -> tokio::task::JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => info!(
                    session_id = %change.session_id,
                    state = %change.new_state,
                    at = %change.timestamp,
                    "state change"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "state change log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
