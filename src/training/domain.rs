//! Domain types for candidate training and model artifacts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::config::AppCfg;
use crate::common::error::{PipelineError, PipelineResult};
use crate::common::ids::ContentHash;
use crate::data::domain::{FeatureRow, LocationId};
use crate::evaluation::domain::{EvaluationProtocol, LeaderboardEntry, Metrics};

use super::ensemble::{BoostingModel, ForestModel};
use super::linear::LinearModel;

/// Algorithms competing in the daily tournament.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmId {
    LinearRegression,
    RandomForest,
    GradientBoosting,
}

impl AlgorithmId {
    pub const ALL: [AlgorithmId; 3] = [
        AlgorithmId::LinearRegression,
        AlgorithmId::RandomForest,
        AlgorithmId::GradientBoosting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmId::LinearRegression => "linear_regression",
            AlgorithmId::RandomForest => "random_forest",
            AlgorithmId::GradientBoosting => "gradient_boosting",
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlgorithmId::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| PipelineError::invalid(format!("unknown algorithm `{s}`")))
    }
}

/// The exact range a training run consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingWindow {
    pub location: LocationId,
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub end: DateTime<Utc>,
    pub row_count: usize,
    pub schema_version: u32,
    /// SHA-256 over the rows read, so two runs can tell whether they saw the same data.
    pub digest: String,
}

/// Rows read once at the start of a run. Nothing re-reads the store afterwards.
#[derive(Clone, Debug)]
pub struct TrainingSnapshot {
    pub window: TrainingWindow,
    pub rows: Vec<FeatureRow>,
}

impl TrainingSnapshot {
    /// Complete `(features, target)` pairs, in time order.
    pub fn examples(&self) -> Vec<(Vec<f64>, f64)> {
        self.rows.iter().filter_map(FeatureRow::example).collect()
    }

    /// Stable id of a run over this snapshot.
    pub fn run_id(&self, cfg: &TrainConfig) -> String {
        let mut hash = ContentHash::new();
        hash.field(self.window.location.as_str().as_bytes());
        hash.field(self.window.start.to_rfc3339().as_bytes());
        hash.field(self.window.end.to_rfc3339().as_bytes());
        hash.field(self.window.digest.as_bytes());
        hash.field(cfg.protocol.id.as_bytes());
        for algorithm in &cfg.algorithms {
            hash.field(algorithm.as_str().as_bytes());
        }
        hash.finish_hex()
    }
}

/// Knobs of one training run.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainConfig {
    pub min_rows: usize,
    pub protocol: EvaluationProtocol,
    pub algorithms: Vec<AlgorithmId>,
    pub seed: u64,
}

impl TrainConfig {
    pub fn from_app(cfg: &AppCfg) -> Self {
        Self {
            min_rows: cfg.min_training_rows,
            protocol: EvaluationProtocol::chrono_holdout(cfg.holdout_fraction),
            algorithms: AlgorithmId::ALL.to_vec(),
            seed: 42,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            min_rows: 168,
            protocol: EvaluationProtocol::default(),
            algorithms: AlgorithmId::ALL.to_vec(),
            seed: 42,
        }
    }
}

/// A fitted regressor of any supported family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    Linear(LinearModel),
    Forest(ForestModel),
    Boosting(BoostingModel),
}

impl FittedModel {
    pub fn predict(&self, x: &[f64]) -> f64 {
        match self {
            FittedModel::Linear(m) => m.predict(x),
            FittedModel::Forest(m) => m.predict(x),
            FittedModel::Boosting(m) => m.predict(x),
        }
    }

    pub fn predict_all(&self, xs: &[Vec<f64>]) -> Vec<f64> {
        xs.iter().map(|x| self.predict(x)).collect()
    }
}

/// Something that can fit a [`FittedModel`] from a design matrix.
pub trait Algorithm: Send + Sync {
    fn id(&self) -> AlgorithmId;
    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<FittedModel>;
}

/// Reject empty, ragged or non-finite training data. Returns the column count.
pub(crate) fn check_design(algorithm: AlgorithmId, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<usize> {
    let fail = |reason: String| PipelineError::ModelFit {
        algorithm: algorithm.to_string(),
        reason,
    };
    if x.is_empty() || x.len() != y.len() {
        return Err(fail(format!("{} rows but {} targets", x.len(), y.len())));
    }
    let width = x[0].len();
    if width == 0 || x.iter().any(|row| row.len() != width) {
        return Err(fail("ragged or empty feature rows".into()));
    }
    if x.iter().flatten().chain(y).any(|v| !v.is_finite()) {
        return Err(fail("non-finite training value".into()));
    }
    Ok(width)
}

/// Fit result of one candidate.
#[derive(Clone, Debug)]
pub enum CandidateOutcome {
    Scored { model: FittedModel, metrics: Metrics },
    Failed { reason: String },
}

/// One attempted candidate of a run. Discarded unless promoted.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub algorithm: AlgorithmId,
    pub window: TrainingWindow,
    pub protocol: String,
    pub outcome: CandidateOutcome,
}

impl Candidate {
    pub fn metrics(&self) -> Option<&Metrics> {
        match &self.outcome {
            CandidateOutcome::Scored { metrics, .. } => Some(metrics),
            CandidateOutcome::Failed { .. } => None,
        }
    }

    pub fn model(&self) -> Option<&FittedModel> {
        match &self.outcome {
            CandidateOutcome::Scored { model, .. } => Some(model),
            CandidateOutcome::Failed { .. } => None,
        }
    }

    pub fn leaderboard_entry(&self) -> LeaderboardEntry {
        match &self.outcome {
            CandidateOutcome::Scored { metrics, .. } => LeaderboardEntry {
                algorithm: self.algorithm,
                metrics: Some(*metrics),
                failure: None,
            },
            CandidateOutcome::Failed { reason } => LeaderboardEntry {
                algorithm: self.algorithm,
                metrics: None,
                failure: Some(reason.clone()),
            },
        }
    }
}

/// Leaderboard of a run, best first, failures last.
pub fn leaderboard(candidates: &[Candidate]) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<_> = candidates.iter().map(Candidate::leaderboard_entry).collect();
    entries.sort_by(|a, b| match (&a.metrics, &b.metrics) {
        (Some(x), Some(y)) => x.rank_cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.algorithm.cmp(&b.algorithm),
    });
    entries
}

/// What gets written to the artifact store for a promoted model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredModel {
    pub algorithm: AlgorithmId,
    pub feature_names: Vec<String>,
    pub schema_version: u32,
    pub window: TrainingWindow,
    pub model: FittedModel,
}

/// Content-addressed pointer to a stored model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub sha256: String,
}

/// Repository contract for model artifacts.
pub trait ArtifactRepo: Send + Sync {
    fn put_artifact(&self, model: &StoredModel) -> PipelineResult<ArtifactRef>;
    fn get_artifact(&self, artifact: &ArtifactRef) -> PipelineResult<StoredModel>;
}
