//! Champion records, the registry contracts and the training-run audit log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::PipelineResult;
use crate::evaluation::domain::{LeaderboardEntry, Metrics};
use crate::training::domain::{AlgorithmId, ArtifactRef, TrainingWindow};

/// Monotonic champion version, starting at 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// An entry of the append-only champion history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub version: VersionId,
    pub algorithm: AlgorithmId,
    pub artifact: ArtifactRef,
    pub metrics: Metrics,
    /// Evaluation protocol the metrics were computed under.
    pub protocol: String,
    pub window: TrainingWindow,
    pub promoted_at: DateTime<Utc>,
    #[serde(default)]
    pub leaderboard: Vec<LeaderboardEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A champion record before the registry has assigned it a version.
#[derive(Clone, Debug, PartialEq)]
pub struct ChampionDraft {
    pub algorithm: AlgorithmId,
    pub artifact: ArtifactRef,
    pub metrics: Metrics,
    pub protocol: String,
    pub window: TrainingWindow,
    pub promoted_at: DateTime<Utc>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub note: Option<String>,
}

impl ChampionDraft {
    pub fn into_record(self, version: VersionId) -> ChampionRecord {
        ChampionRecord {
            version,
            algorithm: self.algorithm,
            artifact: self.artifact,
            metrics: self.metrics,
            protocol: self.protocol,
            window: self.window,
            promoted_at: self.promoted_at,
            leaderboard: self.leaderboard,
            note: self.note,
        }
    }
}

/// Guard on a pointer swap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Precondition {
    /// Append unconditionally; concurrent writers are applied in commit order.
    Any,
    /// Swap only if the pointer still names this version (`None`: no champion yet).
    Current(Option<VersionId>),
}

/// Read side of the registry. Works on read-only handles.
pub trait RegistryRead: Send + Sync {
    fn current_champion(&self) -> PipelineResult<Option<ChampionRecord>>;
    /// Every record ever promoted, ascending by version.
    fn history(&self) -> PipelineResult<Vec<ChampionRecord>>;
    fn champion(&self, version: VersionId) -> PipelineResult<Option<ChampionRecord>>;
}

/// Versioned champion store. `record_new_champion` is the only mutator of
/// the pointer.
pub trait ModelRegistry: RegistryRead {
    /// Append `draft` to history and point at it, atomically.
    fn record_new_champion(&self, draft: ChampionDraft, precondition: Precondition) -> PipelineResult<VersionId>;

    /// Append a run audit. Returns `false` if the run id was already recorded.
    fn record_run(&self, audit: &RunAudit) -> PipelineResult<bool>;

    fn find_run(&self, run_id: &str) -> PipelineResult<Option<RunAudit>>;
}

/// How a daily training run ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Promoted,
    Retained,
    NoCandidates,
    InsufficientData,
    /// Another run promoted between our read and our swap.
    Superseded,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Promoted => "promoted",
            RunOutcome::Retained => "retained",
            RunOutcome::NoCandidates => "no_candidates",
            RunOutcome::InsufficientData => "insufficient_data",
            RunOutcome::Superseded => "superseded",
        }
    }
}

/// One row of the training-run audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunAudit {
    pub run_id: String,
    pub window: TrainingWindow,
    pub protocol: String,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub outcome: RunOutcome,
    /// Champion current once the run finished.
    pub champion_version: Option<VersionId>,
    pub recorded_at: DateTime<Utc>,
}
