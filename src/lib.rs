#![forbid(unsafe_code)]

//! Stream session and schedule orchestration for long-running encoder processes.

pub mod config;
pub mod errors;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
