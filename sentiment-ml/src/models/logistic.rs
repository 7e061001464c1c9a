//! Multinomial logistic regression fitted by full-batch gradient descent.

use super::{Estimator, softmax};
use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Inverse regularization strength; the L2 penalty is `1 / (c * n)`.
    pub c: f64,
    pub max_iter: usize,
    pub learning_rate: f64,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new(2.0, 100)
    }
}

impl LogisticRegression {
    pub fn new(c: f64, max_iter: usize) -> Self {
        Self {
            c,
            max_iter,
            learning_rate: 0.5,
            weights: Vec::new(),
            bias: Vec::new(),
        }
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn unfitted(&self) -> Self {
        Self::new(self.c, self.max_iter).with_learning_rate(self.learning_rate)
    }

    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("C".to_string(), self.c.to_string()),
            ("max_iter".to_string(), self.max_iter.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
            ("penalty".to_string(), "l2".to_string()),
        ])
    }

    fn logits(&self, row: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| w.iter().zip(row).map(|(a, x)| a * x).sum::<f64>() + b)
            .collect()
    }
}

impl Estimator for LogisticRegression {
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(MlError::training(format!(
                "logistic regression needs matching non-empty inputs ({} rows, {} labels)",
                x.len(),
                y.len()
            )));
        }
        let dim = x[0].len();
        let n = x.len() as f64;
        let k = n_classes.max(2);
        let l2 = 1.0 / (self.c * n);
        self.weights = vec![vec![0.0; dim]; k];
        self.bias = vec![0.0; k];

        for _ in 0..self.max_iter {
            let mut grad_w = vec![vec![0.0; dim]; k];
            let mut grad_b = vec![0.0; k];
            for (row, &label) in x.iter().zip(y) {
                let p = softmax(&self.logits(row));
                for class in 0..k {
                    let err = p[class] - if class == label { 1.0 } else { 0.0 };
                    if err == 0.0 {
                        continue;
                    }
                    grad_b[class] += err;
                    for (g, v) in grad_w[class].iter_mut().zip(row) {
                        *g += err * v;
                    }
                }
            }
            for class in 0..k {
                for (w, g) in self.weights[class].iter_mut().zip(&grad_w[class]) {
                    *w -= self.learning_rate * (g / n + l2 * *w);
                }
                self.bias[class] -= self.learning_rate * grad_b[class] / n;
            }
        }
        Ok(())
    }

    fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        softmax(&self.logits(row))
    }

    fn is_fitted(&self) -> bool {
        !self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separable_classes() {
        let x = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        let y = vec![0, 0, 1, 1];
        let mut lr = LogisticRegression::default();
        lr.fit(&x, &y, 2).unwrap();
        assert_eq!(lr.predict(&[1.0, 0.0]), 0);
        assert_eq!(lr.predict(&[0.0, 1.0]), 1);
        let p = lr.predict_proba(&[1.0, 0.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(p[0] > 0.5);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let mut lr = LogisticRegression::default();
        assert!(lr.fit(&[vec![1.0]], &[0, 1], 2).is_err());
        assert!(!lr.is_fitted());
    }
}
