//! Session orchestration modules.
//!
//! Covers the per-session state machine, startup reconciliation, crash
//! detection, and the context that wires them together.

pub mod conductor;
pub mod monitor;
pub mod reconciler;
pub mod registry;

pub use conductor::Conductor;
pub use reconciler::ReconcileReport;
pub use registry::SessionRegistry;
