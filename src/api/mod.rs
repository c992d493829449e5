//! Entry points for the scheduler and operators.

pub mod triggers;

pub use triggers::{DailyOutcome, Pipeline};
