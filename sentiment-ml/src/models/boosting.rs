//! Softmax gradient boosting with shallow regression trees.
//!
//! One tree per class per round is fitted to the negative gradient of the
//! cross-entropy loss; leaf weights take a Newton step
//! `sum(g) / (sum(h) + lambda)`.

use super::tree::{BinnedMatrix, Target, Tree, TreeParams, grow};
use super::{Estimator, softmax};
use crate::error::{MlError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const LAMBDA: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoosting {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub subsample: f64,
    pub seed: u64,
    n_classes: usize,
    /// `rounds[r][class]`
    rounds: Vec<Vec<Tree>>,
}

impl Default for GradientBoosting {
    fn default() -> Self {
        Self::new(10, 0.01, 3, 0.7, 42)
    }
}

impl GradientBoosting {
    pub fn new(
        n_estimators: usize,
        learning_rate: f64,
        max_depth: usize,
        subsample: f64,
        seed: u64,
    ) -> Self {
        Self {
            n_estimators,
            learning_rate,
            max_depth,
            subsample,
            seed,
            n_classes: 0,
            rounds: Vec::new(),
        }
    }

    pub fn unfitted(&self) -> Self {
        Self::new(
            self.n_estimators,
            self.learning_rate,
            self.max_depth,
            self.subsample,
            self.seed,
        )
    }

    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("n_estimators".to_string(), self.n_estimators.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
            ("max_depth".to_string(), self.max_depth.to_string()),
            ("subsample".to_string(), self.subsample.to_string()),
            ("random_state".to_string(), self.seed.to_string()),
        ])
    }

    fn raw_scores(&self, row: &[f64]) -> Vec<f64> {
        let mut scores = vec![0.0; self.n_classes];
        for round in &self.rounds {
            for (s, tree) in scores.iter_mut().zip(round) {
                *s += self.learning_rate * tree.evaluate(row).first().copied().unwrap_or(0.0);
            }
        }
        scores
    }
}

impl Estimator for GradientBoosting {
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(MlError::training("gradient boosting needs matching non-empty inputs"));
        }
        let n = x.len();
        let k = n_classes.max(2);
        let binned = BinnedMatrix::new(x);
        let params = TreeParams {
            max_depth: self.max_depth,
            max_features: None,
            min_samples_split: 2,
        };
        let sample_size = ((n as f64 * self.subsample.clamp(0.0, 1.0)).ceil() as usize).clamp(1, n);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut scores = vec![vec![0.0; k]; n];

        self.n_classes = k;
        self.rounds = Vec::with_capacity(self.n_estimators);
        for _ in 0..self.n_estimators {
            let rows = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
            let proba: Vec<Vec<f64>> = scores.iter().map(|s| softmax(s)).collect();
            let mut round = Vec::with_capacity(k);
            for class in 0..k {
                let grad: Vec<f64> = (0..n)
                    .map(|i| if y[i] == class { 1.0 } else { 0.0 } - proba[i][class])
                    .collect();
                let hess: Vec<f64> = (0..n)
                    .map(|i| (proba[i][class] * (1.0 - proba[i][class])).max(1e-16))
                    .collect();
                let leaf = |leaf_rows: &[usize]| {
                    let g: f64 = leaf_rows.iter().map(|&r| grad[r]).sum();
                    let h: f64 = leaf_rows.iter().map(|&r| hess[r]).sum();
                    vec![g / (h + LAMBDA)]
                };
                let tree = grow(
                    &binned,
                    Target::Values(&grad),
                    rows.clone(),
                    &params,
                    &mut rng,
                    &leaf,
                );
                for (i, row) in x.iter().enumerate() {
                    scores[i][class] +=
                        self.learning_rate * tree.evaluate(row).first().copied().unwrap_or(0.0);
                }
                round.push(tree);
            }
            self.rounds.push(round);
        }
        Ok(())
    }

    fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        softmax(&self.raw_scores(row))
    }

    fn is_fitted(&self) -> bool {
        !self.rounds.is_empty()
    }
}
