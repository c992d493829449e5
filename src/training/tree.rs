//! CART regression trees, the building block of both ensembles.
//!
//! Nodes live in a flat vector and refer to children by index. Traversal
//! goes left when `x[feature] <= threshold`.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Split gains below this are treated as no improvement.
const MIN_GAIN: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Columns drawn per split; `None` considers all of them.
    pub max_features: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Grower<'a> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    params: &'a TreeParams,
    width: usize,
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Fit on the rows listed in `sample` (repeats allowed, for bootstrapping).
    pub fn fit(x: &[Vec<f64>], y: &[f64], sample: Vec<usize>, params: &TreeParams, rng: &mut StdRng) -> Self {
        let mut grower = Grower {
            x,
            y,
            params,
            width: x.first().map_or(0, Vec::len),
            nodes: Vec::new(),
        };
        grower.grow(sample, 0, rng);
        Self {
            nodes: grower.nodes,
        }
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes.get(at) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = x.get(*feature).copied().unwrap_or(f64::NAN);
                    at = if v <= *threshold { *left } else { *right };
                }
                None => return f64::NAN,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match nodes.get(at) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

impl Grower<'_> {
    fn grow(&mut self, sample: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let value = sample.iter().map(|&i| self.y[i]).sum::<f64>() / sample.len().max(1) as f64;
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        if depth >= self.params.max_depth || sample.len() < 2 * self.params.min_samples_leaf.max(1) {
            return at;
        }
        let Some(split) = self.best_split(&sample, rng) else {
            return at;
        };
        let (left, right): (Vec<usize>, Vec<usize>) = sample
            .into_iter()
            .partition(|&i| self.x[i][split.feature] <= split.threshold);
        let left = self.grow(left, depth + 1, rng);
        let right = self.grow(right, depth + 1, rng);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }

    fn candidate_features(&self, rng: &mut StdRng) -> Vec<usize> {
        match self.params.max_features {
            Some(m) if m < self.width => {
                let mut picked = rand::seq::index::sample(rng, self.width, m.max(1)).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..self.width).collect(),
        }
    }

    /// Best variance-reducing split over the candidate features.
    fn best_split(&self, sample: &[usize], rng: &mut StdRng) -> Option<Split> {
        let n = sample.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let total: f64 = sample.iter().map(|&i| self.y[i]).sum();
        let parent = total * total / n as f64;

        let mut best: Option<Split> = None;
        let mut order = sample.to_vec();
        for feature in self.candidate_features(rng) {
            order.sort_by(|&a, &b| self.x[a][feature].total_cmp(&self.x[b][feature]));
            let mut left_sum = 0.0;
            for k in 1..n {
                left_sum += self.y[order[k - 1]];
                if k < min_leaf || n - k < min_leaf {
                    continue;
                }
                let lo = self.x[order[k - 1]][feature];
                let hi = self.x[order[k]][feature];
                if lo == hi {
                    continue;
                }
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / k as f64 + right_sum * right_sum / (n - k) as f64;
                let gain = score - parent;
                if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(Split {
                        feature,
                        threshold: lo + (hi - lo) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y = x.iter().map(|r| if r[0] < 50.0 { 10.0 } else { 30.0 }).collect();
        (x, y)
    }

    #[test]
    fn learns_a_step_function() {
        let (x, y) = step_data();
        let params = TreeParams {
            max_depth: 3,
            min_samples_leaf: 1,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let tree = RegressionTree::fit(&x, &y, (0..100).collect(), &params, &mut rng);
        assert_eq!(tree.predict(&[10.0, 0.0]), 10.0);
        assert_eq!(tree.predict(&[75.0, 2.0]), 30.0);
        // one split separates the halves exactly
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn depth_and_leaf_size_are_respected() {
        let x: Vec<Vec<f64>> = (0..64).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..64).map(|i| (i * i) as f64).collect();
        let params = TreeParams {
            max_depth: 2,
            min_samples_leaf: 20,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let tree = RegressionTree::fit(&x, &y, (0..64).collect(), &params, &mut rng);
        assert!(tree.depth() <= 2);
        // 64 rows cannot be cut into more than three leaves of 20
        assert!(tree.node_count() <= 5);
    }

    #[test]
    fn constant_target_is_a_single_leaf() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let y = vec![7.0; 20];
        let params = TreeParams {
            max_depth: 5,
            min_samples_leaf: 1,
            max_features: None,
        };
        let tree = RegressionTree::fit(&x, &y, (0..20).collect(), &params, &mut StdRng::seed_from_u64(0));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict(&[100.0]), 7.0);
    }
}
