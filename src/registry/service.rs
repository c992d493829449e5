//! Promotion stage and operator rollback.

use chrono::{DateTime, Utc};

use crate::common::error::{PipelineError, PipelineResult};
use crate::common::log::StageTimer;
use crate::data::domain::FEATURE_NAMES;
use crate::evaluation::domain::LeaderboardEntry;
use crate::evaluation::service::{holdout_split, score};
use crate::training::domain::{
    leaderboard, ArtifactRepo, Candidate, CandidateOutcome, StoredModel, TrainConfig, TrainingSnapshot,
};
use crate::training::service::usable_examples;

use super::domain::{ChampionDraft, ChampionRecord, ModelRegistry, Precondition, VersionId};

/// Result of a promotion attempt that did not fail.
#[derive(Clone, Debug, PartialEq)]
pub enum PromotionOutcome {
    Promoted(ChampionRecord),
    Retained {
        champion: ChampionRecord,
        best: LeaderboardEntry,
    },
}

/// Best scored candidate: lowest RMSE, then lowest MAE, then highest R².
/// Full ties keep the earlier candidate.
pub fn select_best(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .filter_map(|c| c.metrics().map(|m| (c, m)))
        .min_by(|(_, a), (_, b)| a.rank_cmp(b))
        .map(|(c, _)| c)
}

/// Promote the best candidate iff it strictly beats `current` on RMSE.
///
/// `current` is the champion read when the run started; the pointer swap is
/// conditioned on it, so a concurrent promotion surfaces as
/// [`PipelineError::RegistryConflict`] instead of being overwritten.
pub fn promote(
    registry: &dyn ModelRegistry,
    artifacts: &dyn ArtifactRepo,
    candidates: &[Candidate],
    current: Option<&ChampionRecord>,
    promoted_at: DateTime<Utc>,
) -> PipelineResult<PromotionOutcome> {
    let timer = StageTimer::start("promote");
    let result = decide_and_swap(registry, artifacts, candidates, current, promoted_at);
    match &result {
        Ok(PromotionOutcome::Promoted(record)) => {
            tracing::info!(
                decision = "promoted",
                version = %record.version,
                algorithm = %record.algorithm,
                rmse = record.metrics.rmse,
                previous_rmse = current.map(|c| c.metrics.rmse),
                "champion promoted"
            );
            timer.ok("promote.promoted");
        }
        Ok(PromotionOutcome::Retained { champion, best }) => {
            tracing::info!(
                decision = "retained",
                version = %champion.version,
                champion_rmse = champion.metrics.rmse,
                best_algorithm = %best.algorithm,
                best_rmse = best.metrics.map(|m| m.rmse),
                "champion retained"
            );
            timer.ok("promote.retained");
        }
        Err(err) => timer.fail("promote.run", err),
    }
    result
}

fn decide_and_swap(
    registry: &dyn ModelRegistry,
    artifacts: &dyn ArtifactRepo,
    candidates: &[Candidate],
    current: Option<&ChampionRecord>,
    promoted_at: DateTime<Utc>,
) -> PipelineResult<PromotionOutcome> {
    let best = select_best(candidates).ok_or(PipelineError::NoCandidates)?;
    let CandidateOutcome::Scored { model, metrics } = &best.outcome else {
        return Err(PipelineError::NoCandidates);
    };

    if let Some(champion) = current {
        if champion.protocol != best.protocol {
            return Err(PipelineError::ProtocolMismatch {
                champion: champion.protocol.clone(),
                candidates: best.protocol.clone(),
            });
        }
        if metrics.rmse >= champion.metrics.rmse {
            return Ok(PromotionOutcome::Retained {
                champion: champion.clone(),
                best: best.leaderboard_entry(),
            });
        }
    }

    let artifact = artifacts.put_artifact(&StoredModel {
        algorithm: best.algorithm,
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        schema_version: best.window.schema_version,
        window: best.window.clone(),
        model: model.clone(),
    })?;
    let draft = ChampionDraft {
        algorithm: best.algorithm,
        artifact,
        metrics: *metrics,
        protocol: best.protocol.clone(),
        window: best.window.clone(),
        promoted_at,
        leaderboard: leaderboard(candidates),
        note: None,
    };
    let precondition = Precondition::Current(current.map(|c| c.version));
    let version = registry.record_new_champion(draft.clone(), precondition)?;
    Ok(PromotionOutcome::Promoted(draft.into_record(version)))
}

/// Re-promote historical `version` as a new head of history.
///
/// The artifact is loaded first so a rollback never points at a model that
/// cannot be served.
pub fn rollback(
    registry: &dyn ModelRegistry,
    artifacts: &dyn ArtifactRepo,
    version: VersionId,
    now: DateTime<Utc>,
) -> PipelineResult<ChampionRecord> {
    let target = registry
        .champion(version)?
        .ok_or_else(|| PipelineError::invalid(format!("no champion {version} in history")))?;
    artifacts.get_artifact(&target.artifact)?;
    let previous = registry.current_champion()?.map(|c| c.version);
    let draft = ChampionDraft {
        algorithm: target.algorithm,
        artifact: target.artifact,
        metrics: target.metrics,
        protocol: target.protocol,
        window: target.window,
        promoted_at: now,
        leaderboard: target.leaderboard,
        note: Some(format!("rollback to {version}")),
    };
    let new_version = registry.record_new_champion(draft.clone(), Precondition::Current(previous))?;
    tracing::warn!(
        previous = ?previous.map(|v| v.0),
        restored = %version,
        version = %new_version,
        "champion rolled back"
    );
    Ok(draft.into_record(new_version))
}

/// Re-score the current champion under `cfg.protocol` and record the result
/// as a new version.
///
/// Champions scored under an older protocol block every promotion with
/// [`PipelineError::ProtocolMismatch`]. The rescored record keeps the same
/// artifact, so later candidates compare against it on equal terms.
pub fn rebaseline(
    registry: &dyn ModelRegistry,
    artifacts: &dyn ArtifactRepo,
    snapshot: &TrainingSnapshot,
    cfg: &TrainConfig,
    now: DateTime<Utc>,
) -> PipelineResult<ChampionRecord> {
    let timer = StageTimer::start("promote");
    let result = rescore_champion(registry, artifacts, snapshot, cfg, now);
    match &result {
        Ok(record) => {
            tracing::warn!(
                version = %record.version,
                protocol = %record.protocol,
                rmse = record.metrics.rmse,
                "champion rebaselined"
            );
            timer.ok("promote.rebaseline");
        }
        Err(err) => timer.fail("promote.rebaseline", err),
    }
    result
}

fn rescore_champion(
    registry: &dyn ModelRegistry,
    artifacts: &dyn ArtifactRepo,
    snapshot: &TrainingSnapshot,
    cfg: &TrainConfig,
    now: DateTime<Utc>,
) -> PipelineResult<ChampionRecord> {
    let current = registry
        .current_champion()?
        .ok_or_else(|| PipelineError::invalid("no champion to rebaseline"))?;
    if current.protocol == cfg.protocol.id {
        return Err(PipelineError::invalid(format!(
            "{} is already scored under {}",
            current.version, cfg.protocol.id
        )));
    }
    let stored = artifacts.get_artifact(&current.artifact)?;
    let examples = usable_examples(snapshot, cfg)?;
    let (_, eval) = holdout_split(&examples, &cfg.protocol)?;
    let (eval_x, eval_y): (Vec<Vec<f64>>, Vec<f64>) = eval.iter().cloned().unzip();
    let metrics = score(&eval_y, &stored.model.predict_all(&eval_x))?;
    if !metrics.is_finite() {
        return Err(PipelineError::ModelFit {
            algorithm: current.algorithm.to_string(),
            reason: "non-finite evaluation score".into(),
        });
    }

    let draft = ChampionDraft {
        algorithm: current.algorithm,
        artifact: current.artifact,
        metrics,
        protocol: cfg.protocol.id.clone(),
        window: snapshot.window.clone(),
        promoted_at: now,
        leaderboard: Vec::new(),
        note: Some(format!("rebaseline from {}", current.protocol)),
    };
    let version = registry.record_new_champion(draft.clone(), Precondition::Current(Some(current.version)))?;
    Ok(draft.into_record(version))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::data::domain::LocationId;
    use crate::evaluation::domain::Metrics;
    use crate::registry::domain::RegistryRead;
    use crate::registry::repo_sqlite::SqliteRegistry;
    use crate::evaluation::domain::EvaluationProtocol;
    use crate::training::domain::{AlgorithmId, FittedModel, TrainingWindow};
    use crate::training::linear::LinearModel;
    use crate::training::repo_fs::FsArtifactRepo;

    const PROTOCOL: &str = "chrono-holdout-v1@0.2";

    fn window() -> TrainingWindow {
        TrainingWindow {
            location: LocationId::new("karachi"),
            start: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            row_count: 720,
            schema_version: 1,
            digest: "w".into(),
        }
    }

    fn scored(algorithm: AlgorithmId, rmse: f64, mae: f64, r2: f64) -> Candidate {
        Candidate {
            algorithm,
            window: window(),
            protocol: PROTOCOL.into(),
            outcome: CandidateOutcome::Scored {
                model: FittedModel::Linear(LinearModel {
                    intercept: rmse,
                    means: vec![],
                    scales: vec![],
                    weights: vec![],
                }),
                metrics: Metrics { rmse, mae, r2 },
            },
        }
    }

    fn failed(algorithm: AlgorithmId) -> Candidate {
        Candidate {
            algorithm,
            window: window(),
            protocol: PROTOCOL.into(),
            outcome: CandidateOutcome::Failed {
                reason: "boom".into(),
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        registry: SqliteRegistry,
        artifacts: FsArtifactRepo,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = SqliteRegistry::open(&dir.path().join("reg.sqlite3"), Duration::from_secs(5)).unwrap();
        let artifacts = FsArtifactRepo::at(dir.path().join("models"));
        Fixture {
            _dir: dir,
            registry,
            artifacts,
        }
    }

    #[test]
    fn best_candidate_breaks_ties_on_mae_then_r2() {
        let candidates = vec![
            scored(AlgorithmId::LinearRegression, 5.0, 3.0, 0.7),
            scored(AlgorithmId::RandomForest, 5.0, 2.0, 0.6),
            scored(AlgorithmId::GradientBoosting, 5.0, 2.0, 0.8),
            failed(AlgorithmId::LinearRegression),
        ];
        assert_eq!(select_best(&candidates).unwrap().algorithm, AlgorithmId::GradientBoosting);
        assert!(select_best(&[failed(AlgorithmId::RandomForest)]).is_none());
    }

    #[test]
    fn bootstrap_promotes_unconditionally() {
        let f = fixture();
        let candidates = vec![scored(AlgorithmId::RandomForest, 9.0, 6.0, 0.1)];
        let outcome = promote(&f.registry, &f.artifacts, &candidates, None, now()).unwrap();
        let PromotionOutcome::Promoted(record) = outcome else {
            panic!("expected promotion");
        };
        assert_eq!(record.version, VersionId(1));
        assert_eq!(f.registry.current_champion().unwrap(), Some(record.clone()));
        assert!(f.artifacts.get_artifact(&record.artifact).is_ok());
    }

    #[test]
    fn equal_rmse_is_not_an_improvement() {
        let f = fixture();
        promote(&f.registry, &f.artifacts, &[scored(AlgorithmId::RandomForest, 5.0, 3.0, 0.5)], None, now()).unwrap();
        let champion = f.registry.current_champion().unwrap().unwrap();

        let outcome = promote(
            &f.registry,
            &f.artifacts,
            &[scored(AlgorithmId::GradientBoosting, 5.0, 1.0, 0.9)],
            Some(&champion),
            now(),
        )
        .unwrap();
        assert!(matches!(outcome, PromotionOutcome::Retained { .. }));
        assert_eq!(f.registry.history().unwrap().len(), 1);
    }

    #[test]
    fn empty_or_failed_candidates_retain_the_champion() {
        let f = fixture();
        let err = promote(&f.registry, &f.artifacts, &[], None, now()).unwrap_err();
        assert!(matches!(err, PipelineError::NoCandidates));
        let err = promote(&f.registry, &f.artifacts, &[failed(AlgorithmId::RandomForest)], None, now()).unwrap_err();
        assert!(err.is_alert_worthy());
        assert!(f.registry.current_champion().unwrap().is_none());
    }

    #[test]
    fn protocol_mismatch_refuses_to_compare() {
        let f = fixture();
        promote(&f.registry, &f.artifacts, &[scored(AlgorithmId::RandomForest, 5.0, 3.0, 0.5)], None, now()).unwrap();
        let mut champion = f.registry.current_champion().unwrap().unwrap();
        champion.protocol = "kfold-v1".into();
        let err = promote(
            &f.registry,
            &f.artifacts,
            &[scored(AlgorithmId::LinearRegression, 1.0, 1.0, 0.9)],
            Some(&champion),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ProtocolMismatch { .. }));
        assert_eq!(f.registry.history().unwrap().len(), 1);
    }

    #[test]
    fn rollback_appends_a_new_version() {
        let f = fixture();
        promote(&f.registry, &f.artifacts, &[scored(AlgorithmId::RandomForest, 6.0, 3.0, 0.5)], None, now()).unwrap();
        let v1 = f.registry.current_champion().unwrap().unwrap();
        promote(
            &f.registry,
            &f.artifacts,
            &[scored(AlgorithmId::LinearRegression, 5.0, 3.0, 0.5)],
            Some(&v1),
            now(),
        )
        .unwrap();

        let restored = rollback(&f.registry, &f.artifacts, VersionId(1), now()).unwrap();
        assert_eq!(restored.version, VersionId(3));
        assert_eq!(restored.artifact, v1.artifact);
        assert_eq!(f.registry.current_champion().unwrap().unwrap().metrics.rmse, 6.0);
        assert_eq!(f.registry.history().unwrap().len(), 3);
        assert!(rollback(&f.registry, &f.artifacts, VersionId(9), now()).is_err());
    }

    #[test]
    fn rebaseline_needs_a_champion_under_another_protocol() {
        let f = fixture();
        let empty = TrainingSnapshot {
            window: window(),
            rows: Vec::new(),
        };
        let cfg = TrainConfig::default();
        let err = rebaseline(&f.registry, &f.artifacts, &empty, &cfg, now()).unwrap_err();
        assert!(matches!(err, PipelineError::Invalid(_)));

        promote(&f.registry, &f.artifacts, &[scored(AlgorithmId::RandomForest, 5.0, 3.0, 0.5)], None, now()).unwrap();
        let err = rebaseline(&f.registry, &f.artifacts, &empty, &cfg, now()).unwrap_err();
        assert!(matches!(err, PipelineError::Invalid(_)));

        let moved = TrainConfig {
            protocol: EvaluationProtocol::chrono_holdout(0.25),
            ..TrainConfig::default()
        };
        let err = rebaseline(&f.registry, &f.artifacts, &empty, &moved, now()).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { actual: 0, .. }));
        assert_eq!(f.registry.history().unwrap().len(), 1);
    }
}
