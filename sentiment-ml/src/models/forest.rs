//! Random forest of gini trees on bootstrap samples.

use super::Estimator;
use super::tree::{BinnedMatrix, Target, Tree, TreeParams, class_distribution, grow};
use crate::error::{MlError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub seed: u64,
    n_classes: usize,
    trees: Vec<Tree>,
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new(10, 3, 42)
    }
}

impl RandomForest {
    pub fn new(n_estimators: usize, max_depth: usize, seed: u64) -> Self {
        Self {
            n_estimators,
            max_depth,
            seed,
            n_classes: 0,
            trees: Vec::new(),
        }
    }

    pub fn unfitted(&self) -> Self {
        Self::new(self.n_estimators, self.max_depth, self.seed)
    }

    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("n_estimators".to_string(), self.n_estimators.to_string()),
            ("max_depth".to_string(), self.max_depth.to_string()),
            ("max_features".to_string(), "sqrt".to_string()),
            ("random_state".to_string(), self.seed.to_string()),
        ])
    }
}

impl Estimator for RandomForest {
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(MlError::training("random forest needs matching non-empty inputs"));
        }
        let n = x.len();
        let binned = BinnedMatrix::new(x);
        let max_features = ((binned.dim() as f64).sqrt() as usize).max(1);
        let params = TreeParams {
            max_depth: self.max_depth,
            max_features: Some(max_features),
            min_samples_split: 2,
        };
        let leaf = |rows: &[usize]| class_distribution(y, n_classes, rows);

        self.n_classes = n_classes;
        self.trees = (0..self.n_estimators)
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(t as u64));
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                grow(
                    &binned,
                    Target::Classes {
                        labels: y,
                        n_classes,
                    },
                    sample,
                    &params,
                    &mut rng,
                    &leaf,
                )
            })
            .collect();
        Ok(())
    }

    fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let mut proba = vec![0.0; self.n_classes];
        for tree in &self.trees {
            for (p, v) in proba.iter_mut().zip(tree.evaluate(row)) {
                *p += v;
            }
        }
        let t = self.trees.len().max(1) as f64;
        proba.iter_mut().for_each(|p| *p /= t);
        proba
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }
}
