//! Schedule evaluation: trigger computation and the firing loop.

pub mod engine;
pub mod trigger;

pub use engine::{FireOutcome, Firing, ScheduleEngine};
pub use trigger::Zone;
