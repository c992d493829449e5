//! Training stage: snapshot a window, fit every candidate, score them alike.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, TimeDelta, Utc};

use crate::common::error::{PipelineError, PipelineResult};
use crate::common::ids::ContentHash;
use crate::common::log::StageTimer;
use crate::common::time::hour_floor;
use crate::data::domain::{FeatureStore, LocationId, FEATURE_SCHEMA_VERSION};
use crate::evaluation::service::{holdout_split, score};

use super::domain::{Algorithm, Candidate, CandidateOutcome, FittedModel, TrainConfig, TrainingSnapshot, TrainingWindow};

/// The `hours` complete hours before `now`, as `[start, end)`.
pub fn rolling_window(now: DateTime<Utc>, hours: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = hour_floor(now);
    (end - TimeDelta::hours(i64::from(hours)), end)
}

/// Read `[start, end)` once and pin it for the rest of the run.
///
/// Rows written under another feature schema fail the snapshot; they have to
/// be reprocessed first.
pub fn snapshot(
    store: &dyn FeatureStore,
    location: &LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> PipelineResult<TrainingSnapshot> {
    let rows = store.read_range(location, start, end)?;
    let stale: Vec<_> = rows
        .iter()
        .filter(|r| r.schema_version != FEATURE_SCHEMA_VERSION)
        .collect();
    if let Some(first) = stale.first() {
        return Err(PipelineError::SchemaMismatch {
            found: first.schema_version,
            expected: FEATURE_SCHEMA_VERSION,
            stale: stale.len(),
        });
    }

    let mut hash = ContentHash::new();
    for row in &rows {
        hash.field(&row.timestamp.timestamp().to_le_bytes());
        hash.field(serde_json::to_string(&row.features)?.as_bytes());
        hash.field(&row.target.map_or(u64::MAX, f64::to_bits).to_le_bytes());
    }
    Ok(TrainingSnapshot {
        window: TrainingWindow {
            location: location.clone(),
            start,
            end,
            row_count: rows.len(),
            schema_version: FEATURE_SCHEMA_VERSION,
            digest: hash.finish_hex(),
        },
        rows,
    })
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

/// Fit one algorithm; a panic inside it becomes a [`PipelineError::ModelFit`].
fn fit_isolated(algorithm: &dyn Algorithm, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<FittedModel> {
    panic::catch_unwind(AssertUnwindSafe(|| algorithm.fit(x, y))).unwrap_or_else(|payload| {
        Err(PipelineError::ModelFit {
            algorithm: algorithm.id().to_string(),
            reason: format!("panic: {}", panic_reason(payload)),
        })
    })
}

/// Labelled examples of the snapshot, or [`PipelineError::InsufficientData`]
/// when the window or its usable rows fall short of `cfg.min_rows`.
pub fn usable_examples(snapshot: &TrainingSnapshot, cfg: &TrainConfig) -> PipelineResult<Vec<(Vec<f64>, f64)>> {
    let row_count = snapshot.window.row_count;
    if row_count < cfg.min_rows {
        return Err(PipelineError::InsufficientData {
            required: cfg.min_rows,
            actual: row_count,
        });
    }
    let examples = snapshot.examples();
    if examples.len() < cfg.min_rows {
        return Err(PipelineError::InsufficientData {
            required: cfg.min_rows,
            actual: examples.len(),
        });
    }
    Ok(examples)
}

/// Fit and score every algorithm on the snapshot.
///
/// Returns one [`Candidate`] per algorithm, scored or failed. Only a window
/// too small to train on aborts the run.
pub fn train(
    snapshot: &TrainingSnapshot,
    cfg: &TrainConfig,
    algorithms: &[Box<dyn Algorithm>],
) -> PipelineResult<Vec<Candidate>> {
    let window = &snapshot.window;
    let examples = usable_examples(snapshot, cfg)?;
    let (fit, eval) = holdout_split(&examples, &cfg.protocol)?;
    let (fit_x, fit_y): (Vec<Vec<f64>>, Vec<f64>) = fit.iter().cloned().unzip();
    let (eval_x, eval_y): (Vec<Vec<f64>>, Vec<f64>) = eval.iter().cloned().unzip();
    tracing::info!(
        rows = window.row_count,
        usable = examples.len(),
        fit = fit_x.len(),
        eval = eval_x.len(),
        protocol = %cfg.protocol.id,
        "training window pinned"
    );

    let mut candidates = Vec::with_capacity(algorithms.len());
    for algorithm in algorithms {
        let timer = StageTimer::start("train");
        let outcome = fit_isolated(algorithm.as_ref(), &fit_x, &fit_y).and_then(|model| {
            let metrics = score(&eval_y, &model.predict_all(&eval_x))?;
            if !metrics.is_finite() {
                return Err(PipelineError::ModelFit {
                    algorithm: algorithm.id().to_string(),
                    reason: "non-finite evaluation score".into(),
                });
            }
            Ok((model, metrics))
        });
        let outcome = match outcome {
            Ok((model, metrics)) => {
                tracing::info!(
                    algorithm = %algorithm.id(),
                    rmse = metrics.rmse,
                    mae = metrics.mae,
                    r2 = metrics.r2,
                    "candidate scored"
                );
                timer.ok("train.candidate");
                CandidateOutcome::Scored { model, metrics }
            }
            Err(err) => {
                timer.fail("train.candidate", &err);
                CandidateOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        candidates.push(Candidate {
            algorithm: algorithm.id(),
            window: window.clone(),
            protocol: cfg.protocol.id.clone(),
            outcome,
        });
    }
    Ok(candidates)
}
