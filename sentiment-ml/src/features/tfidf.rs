//! TF-IDF vectorizer over word n-grams.

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Word n-gram TF-IDF with smooth idf and L2-normalized rows.
///
/// Tokens shorter than two characters are ignored. When `min_df` removes
/// every term (tiny corpora), fitting retries with `min_df = 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    pub max_features: usize,
    pub min_df: usize,
    pub ngram_range: (usize, usize),
    /// term -> column
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfVectorizer {
    pub fn new(max_features: usize) -> Self {
        Self {
            max_features,
            min_df: 2,
            ngram_range: (1, 2),
            vocabulary: HashMap::new(),
            idf: Vec::new(),
        }
    }

    pub fn with_min_df(mut self, min_df: usize) -> Self {
        self.min_df = min_df.max(1);
        self
    }

    pub fn with_ngram_range(mut self, lo: usize, hi: usize) -> Self {
        self.ngram_range = (lo.max(1), hi.max(lo.max(1)));
        self
    }

    /// Number of output columns; zero before fitting.
    pub fn dim(&self) -> usize {
        self.idf.len()
    }

    pub fn is_fitted(&self) -> bool {
        !self.idf.is_empty()
    }

    pub fn vocabulary(&self) -> &HashMap<String, usize> {
        &self.vocabulary
    }

    fn analyze(&self, doc: &str) -> Vec<String> {
        let words: Vec<&str> = doc
            .split_whitespace()
            .filter(|w| w.chars().count() >= 2)
            .collect();
        let (lo, hi) = self.ngram_range;
        let mut grams = Vec::new();
        for n in lo..=hi {
            if n > words.len() {
                break;
            }
            for window in words.windows(n) {
                grams.push(window.join(" "));
            }
        }
        grams
    }

    pub fn fit<S: AsRef<str>>(&mut self, docs: &[S]) -> Result<()> {
        if docs.is_empty() {
            return Err(MlError::training("cannot fit TF-IDF on an empty corpus"));
        }
        let mut df: HashMap<String, usize> = HashMap::new();
        let mut tf: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let grams = self.analyze(doc.as_ref());
            let mut seen = HashSet::new();
            for g in grams {
                *tf.entry(g.clone()).or_default() += 1;
                if seen.insert(g.clone()) {
                    *df.entry(g).or_default() += 1;
                }
            }
        }

        let mut kept: Vec<(&String, usize)> = Vec::new();
        for min_df in [self.min_df, 1] {
            kept = tf
                .iter()
                .filter(|(term, _)| df.get(*term).copied().unwrap_or(0) >= min_df)
                .map(|(term, count)| (term, *count))
                .collect();
            if !kept.is_empty() {
                break;
            }
        }
        if kept.is_empty() {
            return Err(MlError::training(
                "empty vocabulary; documents contain no usable terms",
            ));
        }

        // Most frequent first, lexicographic among equals.
        kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        kept.truncate(self.max_features.max(1));

        let n = docs.len() as f64;
        self.vocabulary = kept
            .iter()
            .enumerate()
            .map(|(i, (term, _))| ((*term).clone(), i))
            .collect();
        self.idf = kept
            .iter()
            .map(|(term, _)| {
                let d = df.get(*term).copied().unwrap_or(0) as f64;
                ((1.0 + n) / (1.0 + d)).ln() + 1.0
            })
            .collect();
        Ok(())
    }

    /// Dense, L2-normalized TF-IDF row for one (already cleaned) document.
    pub fn transform_one(&self, doc: &str) -> Vec<f64> {
        let mut row = vec![0.0; self.dim()];
        for g in self.analyze(doc) {
            if let Some(&col) = self.vocabulary.get(&g) {
                row[col] += 1.0;
            }
        }
        for (v, idf) in row.iter_mut().zip(&self.idf) {
            *v *= idf;
        }
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in row.iter_mut() {
                *v /= norm;
            }
        }
        row
    }

    pub fn transform<S: AsRef<str>>(&self, docs: &[S]) -> Vec<Vec<f64>> {
        docs.iter().map(|d| self.transform_one(d.as_ref())).collect()
    }

    pub fn fit_transform<S: AsRef<str>>(&mut self, docs: &[S]) -> Result<Vec<Vec<f64>>> {
        self.fit(docs)?;
        Ok(self.transform(docs))
    }
}
