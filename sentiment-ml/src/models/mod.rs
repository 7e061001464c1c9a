//! Classifier families used as pipeline heads.
//!
//! Each family is a plain struct implementing [`Estimator`]; [`Classifier`]
//! is the closed set the pipeline serializes, and [`ModelFamily`] is the
//! fixed catalog that names them for runs and artifacts.

pub mod boosting;
pub mod forest;
pub mod logistic;
pub mod naive_bayes;
pub(crate) mod tree;

pub use boosting::GradientBoosting;
pub use forest::RandomForest;
pub use logistic::LogisticRegression;
pub use naive_bayes::NaiveBayes;

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A trainable multi-class classifier over dense feature rows.
pub trait Estimator {
    /// Fit on rows `x` with class ids `y` in `0..n_classes`.
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()>;

    /// Class probabilities for one row; sums to one once fitted.
    fn predict_proba(&self, row: &[f64]) -> Vec<f64>;

    fn predict(&self, row: &[f64]) -> usize {
        argmax(&self.predict_proba(row))
    }

    fn is_fitted(&self) -> bool;
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / logits.len().max(1) as f64; logits.len()];
    }
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

/// Index of the largest value; the first one wins ties. Empty input maps to 0.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// The fixed, ordered catalog of candidate families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    LogisticRegression,
    NaiveBayes,
    RandomForest,
    GradientBoosting,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 4] = [
        Self::LogisticRegression,
        Self::NaiveBayes,
        Self::RandomForest,
        Self::GradientBoosting,
    ];

    /// Short key used in artifact names.
    pub fn key(&self) -> &'static str {
        match self {
            Self::LogisticRegression => "lr",
            Self::NaiveBayes => "nb",
            Self::RandomForest => "rf",
            Self::GradientBoosting => "xgb",
        }
    }

    /// Name used as the tracking run name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::LogisticRegression => "LogisticRegression",
            Self::NaiveBayes => "NaiveBayes",
            Self::RandomForest => "RandomForest",
            Self::GradientBoosting => "XGBoost",
        }
    }

    /// Accepts either the short key or the display name, case-insensitively.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.key().eq_ignore_ascii_case(key) || f.display_name().eq_ignore_ascii_case(key))
    }

    /// Parse a configured family list, keeping catalog order and dropping duplicates.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        if names.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        let mut wanted = Vec::new();
        for name in names {
            let family = Self::from_key(name.as_ref()).ok_or_else(|| {
                MlError::invalid_input(format!("unknown model family '{}'", name.as_ref()))
            })?;
            wanted.push(family);
        }
        Ok(Self::ALL
            .into_iter()
            .filter(|f| wanted.contains(f))
            .collect())
    }

    /// Unfitted classifier with the family's default hyperparameters.
    pub fn default_classifier(&self) -> Classifier {
        match self {
            Self::LogisticRegression => Classifier::LogisticRegression(LogisticRegression::default()),
            Self::NaiveBayes => Classifier::NaiveBayes(NaiveBayes::default()),
            Self::RandomForest => Classifier::RandomForest(RandomForest::default()),
            Self::GradientBoosting => Classifier::GradientBoosting(GradientBoosting::default()),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Classifier {
    LogisticRegression(LogisticRegression),
    NaiveBayes(NaiveBayes),
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
}

impl Classifier {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::LogisticRegression(_) => ModelFamily::LogisticRegression,
            Self::NaiveBayes(_) => ModelFamily::NaiveBayes,
            Self::RandomForest(_) => ModelFamily::RandomForest,
            Self::GradientBoosting(_) => ModelFamily::GradientBoosting,
        }
    }

    /// Same hyperparameters, no fitted state.
    pub fn unfitted(&self) -> Self {
        match self {
            Self::LogisticRegression(m) => Self::LogisticRegression(m.unfitted()),
            Self::NaiveBayes(m) => Self::NaiveBayes(m.unfitted()),
            Self::RandomForest(m) => Self::RandomForest(m.unfitted()),
            Self::GradientBoosting(m) => Self::GradientBoosting(m.unfitted()),
        }
    }

    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        match self {
            Self::LogisticRegression(m) => m.hyperparams(),
            Self::NaiveBayes(m) => m.hyperparams(),
            Self::RandomForest(m) => m.hyperparams(),
            Self::GradientBoosting(m) => m.hyperparams(),
        }
    }

    fn inner(&self) -> &dyn Estimator {
        match self {
            Self::LogisticRegression(m) => m,
            Self::NaiveBayes(m) => m,
            Self::RandomForest(m) => m,
            Self::GradientBoosting(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Estimator {
        match self {
            Self::LogisticRegression(m) => m,
            Self::NaiveBayes(m) => m,
            Self::RandomForest(m) => m,
            Self::GradientBoosting(m) => m,
        }
    }
}

impl Estimator for Classifier {
    fn fit(&mut self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<()> {
        self.inner_mut().fit(x, y, n_classes)
    }

    fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        self.inner().predict_proba(row)
    }

    fn is_fitted(&self) -> bool {
        self.inner().is_fitted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_softmax_sums_to_one_and_is_shift_invariant() {
        let a = softmax(&[1.0, 2.0, 3.0]);
        let b = softmax(&[1001.0, 1002.0, 1003.0]);
        assert!((a.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_family_catalog() {
        let keys: Vec<&str> = ModelFamily::ALL.iter().map(|f| f.key()).collect();
        assert_eq!(keys, vec!["lr", "nb", "rf", "xgb"]);
        assert_eq!(ModelFamily::from_key("XGBoost"), Some(ModelFamily::GradientBoosting));
        assert_eq!(ModelFamily::from_key("rf"), Some(ModelFamily::RandomForest));
        assert_eq!(ModelFamily::from_key("svm"), None);
    }

    #[test]
    fn test_parse_list_keeps_catalog_order() {
        let families = ModelFamily::parse_list(&["xgb", "lr", "lr"]).unwrap();
        assert_eq!(
            families,
            vec![ModelFamily::LogisticRegression, ModelFamily::GradientBoosting]
        );
        assert_eq!(ModelFamily::parse_list::<&str>(&[]).unwrap().len(), 4);
        assert!(ModelFamily::parse_list(&["bogus"]).is_err());
    }

    #[test]
    fn test_classifier_unfitted_drops_state() {
        let mut clf = ModelFamily::LogisticRegression.default_classifier();
        clf.fit(&[vec![1.0], vec![0.0]], &[0, 1], 2).unwrap();
        assert!(clf.is_fitted());
        let fresh = clf.unfitted();
        assert!(!fresh.is_fitted());
        assert_eq!(fresh.hyperparams(), clf.hyperparams());
        assert_eq!(fresh.family(), ModelFamily::LogisticRegression);
    }
}
