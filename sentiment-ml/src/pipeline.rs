//! Text classification pipelines: cleaning, TF-IDF, then a classifier head.
//!
//! A [`SentimentPipeline`] is the unit that gets trained, scored, logged as
//! an artifact and later served. Preprocessing is part of the pipeline so
//! training and serving always see the same features.

use crate::error::{MlError, Result};
use crate::features::{Features, TfidfVectorizer};
use crate::models::{Classifier, Estimator, ModelFamily};
use crate::text::clean_text;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Explicit interface every served model exposes.
pub trait TextClassifier: Send + Sync {
    fn preprocess(&self, text: &str) -> Features;

    fn predict(&self, features: &Features) -> usize;

    fn predict_proba(&self, features: &Features) -> Vec<f64>;

    fn predict_text(&self, text: &str) -> usize {
        self.predict(&self.preprocess(text))
    }

    fn predict_proba_text(&self, text: &str) -> Vec<f64> {
        self.predict_proba(&self.preprocess(text))
    }
}

/// Knobs shared by every candidate of one training round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub max_features: usize,
    pub min_df: usize,
    pub ngram_range: (usize, usize),
    pub test_size: f64,
    pub random_state: u64,
    pub families: Vec<ModelFamily>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            max_features: 300,
            min_df: 2,
            ngram_range: (1, 2),
            test_size: 0.5,
            random_state: 42,
            families: ModelFamily::ALL.to_vec(),
        }
    }
}

impl TrainingParams {
    pub fn from_config(cfg: &sentiment_core::config::TrainingConfig) -> Result<Self> {
        Ok(Self {
            max_features: cfg.max_features,
            test_size: cfg.test_size,
            random_state: cfg.random_state,
            families: ModelFamily::parse_list(&cfg.families)?,
            ..Self::default()
        })
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = max_features;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentPipeline {
    vectorizer: TfidfVectorizer,
    classifier: Classifier,
    n_classes: usize,
}

impl SentimentPipeline {
    pub fn new(vectorizer: TfidfVectorizer, classifier: Classifier) -> Self {
        Self {
            vectorizer,
            classifier,
            n_classes: 0,
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.classifier.family()
    }

    pub fn vectorizer(&self) -> &TfidfVectorizer {
        &self.vectorizer
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn is_fitted(&self) -> bool {
        self.vectorizer.is_fitted() && self.classifier.is_fitted()
    }

    /// Hyperparameters of both stages, prefixed by stage name.
    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::from([
            ("tfidf__max_features".to_string(), self.vectorizer.max_features.to_string()),
            ("tfidf__min_df".to_string(), self.vectorizer.min_df.to_string()),
            (
                "tfidf__ngram_range".to_string(),
                format!("({}, {})", self.vectorizer.ngram_range.0, self.vectorizer.ngram_range.1),
            ),
        ]);
        for (k, v) in self.classifier.hyperparams() {
            params.insert(format!("clf__{k}"), v);
        }
        params
    }

    /// Fit the vectorizer and classifier on raw texts and encoded labels.
    pub fn fit<S: AsRef<str>>(&mut self, texts: &[S], labels: &[usize], n_classes: usize) -> Result<()> {
        if texts.len() != labels.len() {
            return Err(MlError::training(format!(
                "{} texts but {} labels",
                texts.len(),
                labels.len()
            )));
        }
        let cleaned: Vec<String> = texts.iter().map(|t| clean_text(t.as_ref())).collect();
        let x = self.vectorizer.fit_transform(&cleaned)?;
        self.classifier.fit(&x, labels, n_classes)?;
        self.n_classes = n_classes;
        Ok(())
    }

    /// Features for a batch of raw texts.
    pub fn transform<S: AsRef<str>>(&self, texts: &[S]) -> Vec<Features> {
        texts.iter().map(|t| self.preprocess(t.as_ref())).collect()
    }

    pub fn predict_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<usize>> {
        self.ensure_fitted()?;
        Ok(texts.iter().map(|t| self.predict_text(t.as_ref())).collect())
    }

    pub fn predict_proba_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Vec<f64>>> {
        self.ensure_fitted()?;
        Ok(texts.iter().map(|t| self.predict_proba_text(t.as_ref())).collect())
    }

    fn ensure_fitted(&self) -> Result<()> {
        if self.is_fitted() {
            Ok(())
        } else {
            Err(MlError::inference(format!(
                "{} pipeline is not fitted",
                self.family()
            )))
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let pipeline: Self = serde_json::from_slice(bytes)?;
        if !pipeline.is_fitted() {
            return Err(MlError::model("stored pipeline is not fitted"));
        }
        Ok(pipeline)
    }
}

impl TextClassifier for SentimentPipeline {
    fn preprocess(&self, text: &str) -> Features {
        self.vectorizer.transform_one(&clean_text(text))
    }

    fn predict(&self, features: &Features) -> usize {
        self.classifier.predict(features)
    }

    fn predict_proba(&self, features: &Features) -> Vec<f64> {
        self.classifier.predict_proba(features)
    }
}

/// One unfitted pipeline per requested family, in catalog order.
pub fn build_pipelines(params: &TrainingParams) -> Vec<SentimentPipeline> {
    ModelFamily::ALL
        .into_iter()
        .filter(|f| params.families.contains(f))
        .map(|family| {
            let vectorizer = TfidfVectorizer::new(params.max_features)
                .with_min_df(params.min_df)
                .with_ngram_range(params.ngram_range.0, params.ngram_range.1);
            SentimentPipeline::new(vectorizer, family.default_classifier())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn corpus() -> (Vec<&'static str>, Vec<usize>) {
        (
            vec![
                "Great battery, love this phone!",
                "Amazing camera and great screen",
                "love the great design",
                "Terrible battery, awful phone",
                "awful screen and terrible support",
                "terrible awful experience",
            ],
            vec![1, 1, 1, 0, 0, 0],
        )
    }

    #[test]
    fn test_build_pipelines_follows_catalog_order() {
        let params = TrainingParams {
            families: vec![ModelFamily::GradientBoosting, ModelFamily::LogisticRegression],
            ..TrainingParams::default()
        };
        let families: Vec<ModelFamily> = build_pipelines(&params).iter().map(|p| p.family()).collect();
        assert_eq!(
            families,
            vec![ModelFamily::LogisticRegression, ModelFamily::GradientBoosting]
        );
    }

    #[test]
    fn test_fit_predict_and_roundtrip() {
        let (texts, labels) = corpus();
        let mut pipe = build_pipelines(&TrainingParams::default()).remove(0);
        pipe.fit(&texts, &labels, 2).unwrap();
        assert_eq!(pipe.predict_text("great phone, love it"), 1);
        assert_eq!(pipe.predict_text("awful terrible battery"), 0);

        let restored = SentimentPipeline::from_json(&pipe.to_json().unwrap()).unwrap();
        assert_eq!(
            restored.predict_batch(&texts).unwrap(),
            pipe.predict_batch(&texts).unwrap()
        );
    }

    #[test]
    fn test_unfitted_pipeline_refuses_inference() {
        let pipe = build_pipelines(&TrainingParams::default()).remove(0);
        assert!(pipe.predict_batch(&["hello"]).is_err());
        assert!(SentimentPipeline::from_json(&pipe.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_hyperparams_are_prefixed() {
        let pipe = build_pipelines(&TrainingParams::default()).remove(0);
        let params = pipe.hyperparams();
        assert_eq!(params.get("tfidf__max_features").map(String::as_str), Some("300"));
        assert_eq!(params.get("clf__C").map(String::as_str), Some("2"));
    }
}
