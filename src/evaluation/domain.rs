//! Evaluation protocol, metrics and leaderboard types.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::training::domain::AlgorithmId;

/// Smallest evaluation subset a protocol accepts.
pub const MIN_EVAL_ROWS: usize = 24;

/// How candidates are scored. Metrics are only comparable when their
/// protocol ids are equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationProtocol {
    pub id: String,
    pub holdout_fraction: f64,
    pub min_eval_rows: usize,
}

impl EvaluationProtocol {
    /// Time-ordered holdout: the last `fraction` of usable rows are evaluated.
    pub fn chrono_holdout(fraction: f64) -> Self {
        Self {
            id: format!("chrono-holdout-v1@{fraction}"),
            holdout_fraction: fraction,
            min_eval_rows: MIN_EVAL_ROWS,
        }
    }
}

impl Default for EvaluationProtocol {
    fn default() -> Self {
        Self::chrono_holdout(0.2)
    }
}

/// Regression scores on an evaluation subset.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
}

impl Metrics {
    pub fn is_finite(&self) -> bool {
        self.rmse.is_finite() && self.mae.is_finite() && self.r2.is_finite()
    }

    /// Leaderboard order: lower RMSE, then lower MAE, then higher R².
    pub fn rank_cmp(&self, other: &Metrics) -> Ordering {
        self.rmse
            .total_cmp(&other.rmse)
            .then(self.mae.total_cmp(&other.mae))
            .then(other.r2.total_cmp(&self.r2))
    }
}

/// One line of a run's leaderboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub algorithm: AlgorithmId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Prediction error for one recent hour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub timestamp: DateTime<Utc>,
    pub actual: f64,
    pub predicted: f64,
}

impl Residual {
    pub fn error(&self) -> f64 {
        self.predicted - self.actual
    }
}

/// Champion accuracy on the most recent real hours.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub evaluated: usize,
    pub rmse: f64,
    pub mae: f64,
    pub residuals: Vec<Residual>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rmse: f64, mae: f64, r2: f64) -> Metrics {
        Metrics { rmse, mae, r2 }
    }

    #[test]
    fn ranking_breaks_ties_on_mae_then_r2() {
        assert_eq!(m(4.8, 3.0, 0.5).rank_cmp(&m(5.0, 1.0, 0.9)), Ordering::Less);
        assert_eq!(m(5.0, 2.0, 0.5).rank_cmp(&m(5.0, 3.0, 0.9)), Ordering::Less);
        assert_eq!(m(5.0, 2.0, 0.9).rank_cmp(&m(5.0, 2.0, 0.5)), Ordering::Less);
        assert_eq!(m(5.0, 2.0, 0.9).rank_cmp(&m(5.0, 2.0, 0.9)), Ordering::Equal);
    }

    #[test]
    fn protocol_id_carries_the_fraction() {
        assert_eq!(EvaluationProtocol::default().id, "chrono-holdout-v1@0.2");
        assert_ne!(
            EvaluationProtocol::chrono_holdout(0.25).id,
            EvaluationProtocol::default().id
        );
    }

    #[test]
    fn nearby_fractions_get_distinct_ids() {
        let a = EvaluationProtocol::chrono_holdout(0.201);
        let b = EvaluationProtocol::chrono_holdout(0.204);
        assert_eq!(a.id, "chrono-holdout-v1@0.201");
        assert_ne!(a.id, b.id);
    }
}
