//! Multinomial naive Bayes with additive smoothing.

use super::{Estimator, softmax};
use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Log prior used for a class with no training rows; finite so it survives JSON.
const EMPTY_CLASS_LOG_PRIOR: f64 = -1.0e12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayes {
    pub alpha: f64,
    class_log_prior: Vec<f64>,
    feature_log_prob: Vec<Vec<f64>>,
}

impl Default for NaiveBayes {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl NaiveBayes {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            class_log_prior: Vec::new(),
            feature_log_prob: Vec::new(),
        }
    }

    pub fn unfitted(&self) -> Self {
        Self::new(self.alpha)
    }

    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("alpha".to_string(), self.alpha.to_string())])
    }
}

impl Estimator for NaiveBayes {
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(MlError::training("naive Bayes needs matching non-empty inputs"));
        }
        if x.iter().flatten().any(|v| *v < 0.0) {
            return Err(MlError::training(
                "multinomial naive Bayes requires non-negative features",
            ));
        }
        let dim = x[0].len();
        let k = n_classes.max(1);
        if let Some(bad) = y.iter().find(|&&label| label >= k) {
            return Err(MlError::training(format!("label {bad} out of range for {k} classes")));
        }
        let mut counts = vec![vec![0.0; dim]; k];
        let mut class_rows = vec![0usize; k];
        for (row, &label) in x.iter().zip(y) {
            class_rows[label] += 1;
            for (c, v) in counts[label].iter_mut().zip(row) {
                *c += v;
            }
        }
        let n = x.len() as f64;
        self.class_log_prior = class_rows
            .iter()
            .map(|&c| {
                if c == 0 {
                    EMPTY_CLASS_LOG_PRIOR
                } else {
                    (c as f64 / n).ln()
                }
            })
            .collect();
        self.feature_log_prob = counts
            .iter()
            .map(|fc| {
                let total: f64 = fc.iter().sum::<f64>() + self.alpha * dim as f64;
                fc.iter().map(|c| ((c + self.alpha) / total).ln()).collect()
            })
            .collect();
        Ok(())
    }

    fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let joint: Vec<f64> = self
            .class_log_prior
            .iter()
            .zip(&self.feature_log_prob)
            .map(|(prior, flp)| prior + flp.iter().zip(row).map(|(l, v)| l * v).sum::<f64>())
            .collect();
        softmax(&joint)
    }

    fn is_fitted(&self) -> bool {
        !self.class_log_prior.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count_classification() {
        let x = vec![
            vec![3.0, 0.0, 1.0],
            vec![2.0, 0.0, 0.0],
            vec![0.0, 3.0, 1.0],
            vec![0.0, 2.0, 0.0],
        ];
        let y = vec![0, 0, 1, 1];
        let mut nb = NaiveBayes::default();
        nb.fit(&x, &y, 2).unwrap();
        assert_eq!(nb.predict(&[1.0, 0.0, 0.0]), 0);
        assert_eq!(nb.predict(&[0.0, 1.0, 0.0]), 1);
    }

    #[test]
    fn test_negative_features_rejected() {
        let mut nb = NaiveBayes::default();
        assert!(nb.fit(&[vec![-1.0, 0.5]], &[0], 2).is_err());
    }

    #[test]
    fn test_unseen_class_gets_no_mass() {
        let mut nb = NaiveBayes::default();
        nb.fit(&[vec![1.0], vec![2.0]], &[0, 0], 2).unwrap();
        let p = nb.predict_proba(&[1.0]);
        assert!(p[1] < 1e-9);
        assert!(serde_json::to_string(&nb).is_ok());
    }
}
