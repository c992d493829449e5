//! Metric computation shared by training, promotion and live checks.
//!
//! Every candidate is scored by the same functions on the same subset, so
//! their metrics can be ranked against each other.

use crate::common::error::{PipelineError, PipelineResult};
use crate::data::domain::FeatureRow;
use crate::training::domain::FittedModel;

use super::domain::{AccuracyReport, EvaluationProtocol, Metrics, Residual};

/// Split time-ordered items into `(fit, eval)` with the last part held out.
pub fn holdout_split<'a, T>(
    items: &'a [T],
    protocol: &EvaluationProtocol,
) -> PipelineResult<(&'a [T], &'a [T])> {
    let n = items.len();
    let eval_len = ((n as f64 * protocol.holdout_fraction).round() as usize).max(protocol.min_eval_rows);
    if eval_len >= n {
        return Err(PipelineError::InsufficientData {
            required: protocol.min_eval_rows + 1,
            actual: n,
        });
    }
    Ok(items.split_at(n - eval_len))
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.len() != predicted.len() || actual.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum();
    sum / actual.len() as f64
}

pub fn mse(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.len() != predicted.len() || actual.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    sum / actual.len() as f64
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    mse(actual, predicted).sqrt()
}

/// Coefficient of determination. A constant target scores 0 unless the
/// prediction is exact.
pub fn r2(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.len() != predicted.len() || actual.is_empty() {
        return f64::NAN;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// RMSE, MAE and R² of `predicted` against `actual`.
pub fn score(actual: &[f64], predicted: &[f64]) -> PipelineResult<Metrics> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return Err(PipelineError::invalid(format!(
            "cannot score {} predictions against {} actuals",
            predicted.len(),
            actual.len()
        )));
    }
    Ok(Metrics {
        rmse: rmse(actual, predicted),
        mae: mae(actual, predicted),
        r2: r2(actual, predicted),
    })
}

/// Score `model` on the latest `hours` complete rows of `rows`.
pub fn check_accuracy(
    model: &FittedModel,
    rows: &[FeatureRow],
    hours: usize,
) -> PipelineResult<AccuracyReport> {
    let usable: Vec<_> = rows
        .iter()
        .filter_map(|r| r.example().map(|(x, y)| (r.timestamp, x, y)))
        .collect();
    let recent = &usable[usable.len().saturating_sub(hours)..];
    if recent.is_empty() {
        return Err(PipelineError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    let residuals: Vec<Residual> = recent
        .iter()
        .map(|(timestamp, x, y)| Residual {
            timestamp: *timestamp,
            actual: *y,
            predicted: model.predict(x),
        })
        .collect();
    let actual: Vec<f64> = residuals.iter().map(|r| r.actual).collect();
    let predicted: Vec<f64> = residuals.iter().map(|r| r.predicted).collect();
    Ok(AccuracyReport {
        evaluated: residuals.len(),
        rmse: rmse(&actual, &predicted),
        mae: mae(&actual, &predicted),
        residuals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holdout_keeps_the_latest_rows_for_evaluation() {
        let items: Vec<u32> = (0..200).collect();
        let (fit, eval) = holdout_split(&items, &EvaluationProtocol::default()).unwrap();
        assert_eq!(fit.len(), 160);
        assert_eq!(eval.len(), 40);
        assert!(fit.last() < eval.first());
    }

    #[test]
    fn holdout_respects_the_evaluation_floor() {
        let items: Vec<u32> = (0..60).collect();
        let (fit, eval) = holdout_split(&items, &EvaluationProtocol::default()).unwrap();
        assert_eq!((fit.len(), eval.len()), (36, 24));

        let tiny: Vec<u32> = (0..24).collect();
        assert!(matches!(
            holdout_split(&tiny, &EvaluationProtocol::default()),
            Err(PipelineError::InsufficientData { actual: 24, .. })
        ));
    }

    #[test]
    fn metrics_match_hand_computation() {
        let actual = [3.0, -0.5, 2.0, 7.0];
        let predicted = [2.5, 0.0, 2.0, 8.0];
        let m = score(&actual, &predicted).unwrap();
        assert!((m.mae - 0.5).abs() < 1e-12);
        assert!((m.rmse - 0.375f64.sqrt()).abs() < 1e-12);
        assert!((m.r2 - 0.948_608_137_044_967_9).abs() < 1e-9);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(score(&[1.0, 2.0], &[1.0]).is_err());
        assert!(score(&[], &[]).is_err());
    }
}
