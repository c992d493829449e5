mod common;

use std::time::Duration;

use aqi_forecast::common::error::{PipelineError, PipelineResult};
use aqi_forecast::evaluation::Metrics;
use aqi_forecast::registry::service::{promote, PromotionOutcome};
use aqi_forecast::registry::{RegistryRead, SqliteRegistry};
use aqi_forecast::training::linear::{LinearModel, RidgeRegression};
use aqi_forecast::training::ensemble::GradientBoosting;
use aqi_forecast::training::service::{snapshot, train};
use aqi_forecast::training::{
    Algorithm, AlgorithmId, Candidate, CandidateOutcome, FittedModel, FsArtifactRepo, TrainConfig,
    TrainingWindow,
};
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const PROTOCOL: &str = "chrono-holdout-v1@0.2";

struct Fixture {
    _dir: TempDir,
    registry: SqliteRegistry,
    artifacts: FsArtifactRepo,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    Fixture {
        registry: SqliteRegistry::open(&dir.path().join("pipeline.sqlite3"), Duration::from_secs(5)).unwrap(),
        artifacts: FsArtifactRepo::at(dir.path().join("models")),
        _dir: dir,
    }
}

fn window() -> TrainingWindow {
    TrainingWindow {
        location: common::location(),
        start: common::at(24),
        end: common::at(744),
        row_count: 720,
        schema_version: 1,
        digest: "synthetic".into(),
    }
}

fn scored(algorithm: AlgorithmId, rmse: f64) -> Candidate {
    Candidate {
        algorithm,
        window: window(),
        protocol: PROTOCOL.into(),
        outcome: CandidateOutcome::Scored {
            model: FittedModel::Linear(LinearModel {
                intercept: rmse,
                means: Vec::new(),
                scales: Vec::new(),
                weights: Vec::new(),
            }),
            metrics: Metrics {
                rmse,
                mae: rmse * 0.8,
                r2: 0.5,
            },
        },
    }
}

fn failed(algorithm: AlgorithmId) -> Candidate {
    Candidate {
        algorithm,
        window: window(),
        protocol: PROTOCOL.into(),
        outcome: CandidateOutcome::Failed {
            reason: "singular design".into(),
        },
    }
}

fn tick(day: i64) -> DateTime<Utc> {
    common::at(744) + TimeDelta::days(day)
}

fn baseline(fx: &Fixture, rmse: f64) {
    let outcome = promote(
        &fx.registry,
        &fx.artifacts,
        &[scored(AlgorithmId::LinearRegression, rmse)],
        None,
        tick(0),
    )
    .unwrap();
    assert!(matches!(outcome, PromotionOutcome::Promoted(_)));
}

#[test]
fn better_candidate_replaces_the_baseline() {
    let fx = fixture();
    baseline(&fx, 5.0);
    let current = fx.registry.current_champion().unwrap();

    let candidates = [
        scored(AlgorithmId::LinearRegression, 5.3),
        scored(AlgorithmId::RandomForest, 4.8),
        scored(AlgorithmId::GradientBoosting, 6.1),
    ];
    let outcome = promote(&fx.registry, &fx.artifacts, &candidates, current.as_ref(), tick(1)).unwrap();

    let PromotionOutcome::Promoted(record) = outcome else {
        panic!("expected a promotion");
    };
    assert_eq!(record.algorithm, AlgorithmId::RandomForest);
    assert_eq!(record.metrics.rmse, 4.8);
    assert_eq!(record.leaderboard.len(), 3);
    assert_eq!(fx.registry.history().unwrap().len(), 2);
    assert_eq!(fx.registry.current_champion().unwrap(), Some(record));
}

#[test]
fn worse_candidates_leave_the_baseline_in_place() {
    let fx = fixture();
    baseline(&fx, 5.0);
    let current = fx.registry.current_champion().unwrap();

    let candidates = [
        scored(AlgorithmId::LinearRegression, 5.1),
        scored(AlgorithmId::RandomForest, 5.4),
        scored(AlgorithmId::GradientBoosting, 6.0),
    ];
    let outcome = promote(&fx.registry, &fx.artifacts, &candidates, current.as_ref(), tick(1)).unwrap();

    let PromotionOutcome::Retained { champion, best } = outcome else {
        panic!("expected the champion to be retained");
    };
    assert_eq!(Some(champion), current);
    assert_eq!(best.algorithm, AlgorithmId::LinearRegression);
    assert_eq!(fx.registry.history().unwrap().len(), 1);
}

#[test]
fn champion_rmse_never_increases() {
    let fx = fixture();
    let mut rng = StdRng::seed_from_u64(7);
    let mut previous = f64::INFINITY;

    for day in 0..40 {
        let candidates: Vec<_> = AlgorithmId::ALL
            .iter()
            .map(|&id| scored(id, rng.gen_range(2.0..12.0)))
            .collect();
        let current = fx.registry.current_champion().unwrap();
        promote(&fx.registry, &fx.artifacts, &candidates, current.as_ref(), tick(day)).unwrap();

        let rmse = fx.registry.current_champion().unwrap().unwrap().metrics.rmse;
        assert!(rmse <= previous, "day {day}: {rmse} > {previous}");
        previous = rmse;
    }
    let history = fx.registry.history().unwrap();
    assert!(history.windows(2).all(|w| w[1].metrics.rmse < w[0].metrics.rmse));
}

#[test]
fn all_failed_candidates_are_reported_and_change_nothing() {
    let fx = fixture();
    baseline(&fx, 5.0);
    let before = fx.registry.current_champion().unwrap();

    let candidates = [failed(AlgorithmId::LinearRegression), failed(AlgorithmId::RandomForest)];
    let err = promote(&fx.registry, &fx.artifacts, &candidates, before.as_ref(), tick(1)).unwrap_err();
    assert!(matches!(err, PipelineError::NoCandidates));
    assert!(err.is_alert_worthy());

    let err = promote(&fx.registry, &fx.artifacts, &[], before.as_ref(), tick(1)).unwrap_err();
    assert!(matches!(err, PipelineError::NoCandidates));
    assert_eq!(fx.registry.current_champion().unwrap(), before);
}

struct Diverges;

impl Algorithm for Diverges {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::RandomForest
    }

    fn fit(&self, _: &[Vec<f64>], _: &[f64]) -> PipelineResult<FittedModel> {
        Err(PipelineError::ModelFit {
            algorithm: self.id().to_string(),
            reason: "diverged".into(),
        })
    }
}

#[test]
fn one_failing_algorithm_does_not_stop_promotion() {
    let fx = fixture();
    let dir = TempDir::new().unwrap();
    let store = common::seeded_store(&dir.path().join("features.sqlite3"), 744);
    let snap = snapshot(&store, &common::location(), common::at(24), common::at(744)).unwrap();
    assert_eq!(snap.window.row_count, 720);

    let algorithms: Vec<Box<dyn Algorithm>> = vec![
        Box::new(RidgeRegression::default()),
        Box::new(Diverges),
        Box::new(GradientBoosting {
            n_estimators: 30,
            ..GradientBoosting::default()
        }),
    ];
    let candidates = train(&snap, &TrainConfig::default(), &algorithms).unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates.iter().filter(|c| c.metrics().is_some()).count(), 2);
    assert!(matches!(candidates[1].outcome, CandidateOutcome::Failed { .. }));

    let outcome = promote(&fx.registry, &fx.artifacts, &candidates, None, tick(0)).unwrap();
    let PromotionOutcome::Promoted(record) = outcome else {
        panic!("bootstrap must promote");
    };
    assert_ne!(record.algorithm, AlgorithmId::RandomForest);
    assert_eq!(record.window, snap.window);
    let failure = record
        .leaderboard
        .iter()
        .find(|e| e.algorithm == AlgorithmId::RandomForest)
        .and_then(|e| e.failure.clone());
    assert_eq!(failure.as_deref(), Some("random_forest failed to fit: diverged"));
}
