//! Uniform scoring of candidate and champion models.

pub mod domain;
pub mod service;

pub use domain::{AccuracyReport, EvaluationProtocol, LeaderboardEntry, Metrics};
