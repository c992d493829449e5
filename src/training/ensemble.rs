//! Tree ensembles: bagged random forest and gradient boosting.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::common::error::PipelineResult;

use super::domain::{check_design, Algorithm, AlgorithmId, FittedModel};
use super::tree::{RegressionTree, TreeParams};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub trees: Vec<RegressionTree>,
}

impl ForestModel {
    pub fn predict(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return f64::NAN;
        }
        self.trees.iter().map(|t| t.predict(x)).sum::<f64>() / self.trees.len() as f64
    }
}

/// Bootstrap-aggregated trees, each split drawn from a third of the columns.
#[derive(Clone, Debug)]
pub struct RandomForest {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for RandomForest {
    fn default() -> Self {
        Self {
            n_trees: 50,
            max_depth: 8,
            min_samples_leaf: 5,
            seed: 42,
        }
    }
}

impl Algorithm for RandomForest {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::RandomForest
    }

    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<FittedModel> {
        let width = check_design(self.id(), x, y)?;
        let n = x.len();
        let params = TreeParams {
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            max_features: Some(width.div_ceil(3).max(1)),
        };
        let mut rng = StdRng::seed_from_u64(self.seed);
        let trees = (0..self.n_trees)
            .map(|_| {
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, y, sample, &params, &mut rng)
            })
            .collect();
        Ok(FittedModel::Forest(ForestModel { trees }))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoostingModel {
    pub base: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

impl BoostingModel {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.base + self.learning_rate * self.trees.iter().map(|t| t.predict(x)).sum::<f64>()
    }
}

/// Least-squares gradient boosting over shallow trees.
#[derive(Clone, Debug)]
pub struct GradientBoosting {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for GradientBoosting {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 5,
            seed: 42,
        }
    }
}

impl Algorithm for GradientBoosting {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::GradientBoosting
    }

    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> PipelineResult<FittedModel> {
        check_design(self.id(), x, y)?;
        let n = x.len();
        let params = TreeParams {
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(self.seed);
        let base = y.iter().sum::<f64>() / n as f64;
        let mut prediction = vec![base; n];
        let mut trees = Vec::with_capacity(self.n_estimators);

        for _ in 0..self.n_estimators {
            let residuals: Vec<f64> = y.iter().zip(&prediction).map(|(t, p)| t - p).collect();
            let tree = RegressionTree::fit(x, &residuals, (0..n).collect(), &params, &mut rng);
            for (p, row) in prediction.iter_mut().zip(x) {
                *p += self.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }
        Ok(FittedModel::Boosting(BoostingModel {
            base,
            learning_rate: self.learning_rate,
            trees,
        }))
    }
}

/// The default tournament line-up, all seeded with `seed`.
pub fn default_algorithms(ids: &[AlgorithmId], seed: u64) -> Vec<Box<dyn Algorithm>> {
    ids.iter()
        .map(|id| -> Box<dyn Algorithm> {
            match id {
                AlgorithmId::LinearRegression => Box::new(super::linear::RidgeRegression::default()),
                AlgorithmId::RandomForest => Box::new(RandomForest {
                    seed,
                    ..RandomForest::default()
                }),
                AlgorithmId::GradientBoosting => Box::new(GradientBoosting {
                    seed,
                    ..GradientBoosting::default()
                }),
            }
        })
        .collect()
}
