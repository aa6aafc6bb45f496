//! Domain model module declarations.

pub mod process;
pub mod schedule;
pub mod session;
