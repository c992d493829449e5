// lib.rs - feature-to-champion pipeline
pub mod api;
pub mod common;
pub mod data;
pub mod evaluation;
pub mod inference;
pub mod registry;
pub mod training;

pub use api::{DailyOutcome, Pipeline};
pub use common::{ErrorCode, PipelineError, PipelineResult};
