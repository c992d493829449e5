//! Ridge-stabilised least squares on standardised features.

use serde::{Deserialize, Serialize};

use crate::common::error::{PipelineError, PipelineResult};

use super::domain::{check_design, Algorithm, AlgorithmId, FittedModel};

/// Columns with a spread below this are treated as constant.
const MIN_SCALE: f64 = 1e-12;
const PIVOT_EPS: f64 = 1e-12;

/// y = intercept + Σ wᵢ · (xᵢ − meanᵢ) / scaleᵢ
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
}

impl LinearModel {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + x.iter()
                .zip(&self.means)
                .zip(&self.scales)
                .zip(&self.weights)
                .map(|(((v, m), s), w)| w * (v - m) / s)
                .sum::<f64>()
    }
}

/// Linear regression with a small L2 penalty so collinear lags stay solvable.
#[derive(Clone, Debug)]
pub struct RidgeRegression {
    pub alpha: f64,
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self { alpha: 1e-3 }
    }
}

impl Algorithm for RidgeRegression {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::LinearRegression
    }

    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<FittedModel> {
        let d = check_design(self.id(), x, y)?;
        let n = x.len() as f64;

        let means: Vec<f64> = (0..d).map(|j| x.iter().map(|r| r[j]).sum::<f64>() / n).collect();
        let scales: Vec<f64> = (0..d)
            .map(|j| {
                let var = x.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
                let sd = var.sqrt();
                if sd < MIN_SCALE {
                    1.0
                } else {
                    sd
                }
            })
            .collect();
        let y_mean = y.iter().sum::<f64>() / n;

        // Normal equations (ZᵀZ + αnI) w = Zᵀ(y − ȳ)
        let mut a = vec![vec![0.0; d]; d];
        let mut b = vec![0.0; d];
        for (row, target) in x.iter().zip(y) {
            let z: Vec<f64> = (0..d).map(|j| (row[j] - means[j]) / scales[j]).collect();
            for i in 0..d {
                b[i] += z[i] * (target - y_mean);
                for j in i..d {
                    a[i][j] += z[i] * z[j];
                }
            }
        }
        for i in 0..d {
            for j in 0..i {
                a[i][j] = a[j][i];
            }
            a[i][i] += self.alpha * n;
        }

        let weights = solve(a, b).ok_or_else(|| PipelineError::ModelFit {
            algorithm: self.id().to_string(),
            reason: "singular normal equations".into(),
        })?;
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(PipelineError::ModelFit {
                algorithm: self.id().to_string(),
                reason: "non-finite coefficients".into(),
            });
        }
        Ok(FittedModel::Linear(LinearModel {
            intercept: y_mean,
            means,
            scales,
            weights,
        }))
    }
}

/// Gaussian elimination with partial pivoting. `None` if `a` is singular.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPS {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut out = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * out[k]).sum();
        out[row] = (b[row] - tail) / a[row][row];
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_a_linear_relationship() {
        let x: Vec<Vec<f64>> = (0..200)
            .map(|i| vec![i as f64 / 10.0, ((i as f64) / 7.0).sin()])
            .collect();
        let y: Vec<f64> = x.iter().map(|r| 2.0 * r[0] + 3.0 * r[1] + 0.5).collect();

        let model = RidgeRegression::default().fit(&x, &y).unwrap();
        for (row, target) in x.iter().zip(&y) {
            assert!((model.predict(row) - target).abs() < 0.05);
        }
    }

    #[test]
    fn constant_columns_do_not_break_the_solve() {
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, 4.0]).collect();
        let y: Vec<f64> = (0..50).map(|i| i as f64 * 1.5).collect();
        let model = RidgeRegression::default().fit(&x, &y).unwrap();
        assert!((model.predict(&[10.0, 4.0]) - 15.0).abs() < 0.1);
    }

    #[test]
    fn singular_systems_are_reported() {
        assert!(solve(vec![vec![1.0, 2.0], vec![2.0, 4.0]], vec![1.0, 2.0]).is_none());
        assert_eq!(
            solve(vec![vec![2.0, 0.0], vec![0.0, 4.0]], vec![2.0, 8.0]),
            Some(vec![1.0, 2.0])
        );
    }
}
