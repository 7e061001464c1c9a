//! Drift between a labeled reference snapshot and an incoming batch of
//! review texts.
//!
//! Five descriptors of the text column are monitored. `text_content` is a
//! domain classifier (TF-IDF + logistic regression) that tries to tell the
//! two samples apart; the others are per-row numbers compared with a
//! two-sample KS test. The drift share is the fraction of descriptors that
//! drifted, so it always lies in `[0, 1]`.

pub mod stats;

use crate::error::{MlError, Result};
use crate::eval::data_report::render_html;
use crate::features::TfidfVectorizer;
use crate::models::{Estimator, LogisticRegression};
use crate::text::{clean_text, non_letter_share, tokenize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sentiment_core::ObjectStore;
use sentiment_core::config::DriftConfig;
use sentiment_core::storage::{CONTENT_TYPE_HTML, CONTENT_TYPE_JSON};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use stats::{ks_two_sample, roc_auc};

/// Number of descriptors that contribute to the drift share.
pub const MONITORED_FEATURES: usize = 5;
const DOMAIN_FOLDS: u64 = 2;
const DOMAIN_MAX_FEATURES: usize = 300;

/// Thresholds for the per-feature tests and the overall decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriftPolicy {
    /// Drift share above which the batch counts as drifted.
    pub threshold: f64,
    /// Held-out ROC AUC above which text content counts as drifted.
    pub auc_threshold: f64,
    /// KS p-value below which a numeric descriptor counts as drifted.
    pub p_value: f64,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            auc_threshold: 0.55,
            p_value: 0.05,
        }
    }
}

impl From<&DriftConfig> for DriftPolicy {
    fn from(cfg: &DriftConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            auc_threshold: cfg.text_auc_threshold,
            p_value: cfg.p_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub feature: String,
    pub stattest: String,
    /// ROC AUC for `text_content`, KS D for the rest.
    pub statistic: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub threshold: f64,
    pub drift_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAssessment {
    pub request_id: String,
    /// SHA-256 of the reference texts.
    pub reference_id: String,
    /// SHA-256 of the current texts.
    pub current_id: String,
    pub reference_rows: usize,
    pub current_rows: usize,
    pub drift_share: f64,
    pub threshold: f64,
    pub drift_detected: bool,
    pub features: Vec<FeatureDrift>,
    pub timestamp: DateTime<Utc>,
}

impl DriftAssessment {
    pub fn to_html(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .features
            .iter()
            .map(|f| {
                vec![
                    f.feature.clone(),
                    f.stattest.clone(),
                    format!("{:.4}", f.statistic),
                    f.p_value.map(|p| format!("{p:.4}")).unwrap_or_else(|| "-".into()),
                    format!("{}", f.threshold),
                    f.drift_detected.to_string(),
                ]
            })
            .collect();
        render_html(
            &format!("Drift Report {}", self.request_id),
            &[
                ("Timestamp", self.timestamp.to_rfc3339()),
                ("Reference", format!("{} rows, sha256 {}", self.reference_rows, self.reference_id)),
                ("Current", format!("{} rows, sha256 {}", self.current_rows, self.current_id)),
                ("Drift share", format!("{:.3}", self.drift_share)),
                ("Threshold", format!("{}", self.threshold)),
                ("Dataset drift", self.drift_detected.to_string()),
            ],
            &["feature", "stattest", "statistic", "p-value", "threshold", "drift"],
            &rows,
        )
    }
}

/// Compares a reference snapshot with a current batch.
#[async_trait]
pub trait DriftDetector: Send + Sync {
    async fn assess(
        &self,
        reference: &[String],
        current: &[String],
        request_id: &str,
    ) -> Result<DriftAssessment>;
}

/// Hex SHA-256 identity of an ordered list of texts.
pub fn snapshot_id(texts: &[String]) -> String {
    let mut hasher = Sha256::new();
    for t in texts {
        hasher.update(t.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn fold_of(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % DOMAIN_FOLDS
}

/// Held-out ROC AUC of a classifier separating reference (0) from current (1).
///
/// Rows are assigned to folds by a hash of their cleaned text, so duplicates
/// never sit on both sides of a fold boundary. Returns 0.5 when no fold can
/// be trained.
pub fn domain_classifier_auc(reference: &[String], current: &[String]) -> f64 {
    let docs: Vec<String> = reference
        .iter()
        .chain(current)
        .map(|t| clean_text(t))
        .collect();
    let labels: Vec<usize> = std::iter::repeat_n(0, reference.len())
        .chain(std::iter::repeat_n(1, current.len()))
        .collect();
    let folds: Vec<u64> = docs.iter().map(|d| fold_of(d)).collect();

    let mut scores = Vec::new();
    let mut truth = Vec::new();
    for fold in 0..DOMAIN_FOLDS {
        let train: Vec<usize> = (0..docs.len()).filter(|&i| folds[i] != fold).collect();
        let test: Vec<usize> = (0..docs.len()).filter(|&i| folds[i] == fold).collect();
        if test.is_empty() || !train.iter().any(|&i| labels[i] == 0) || !train.iter().any(|&i| labels[i] == 1) {
            continue;
        }
        let train_docs: Vec<&str> = train.iter().map(|&i| docs[i].as_str()).collect();
        let mut vectorizer = TfidfVectorizer::new(DOMAIN_MAX_FEATURES);
        let Ok(x) = vectorizer.fit_transform(&train_docs) else {
            continue;
        };
        let y: Vec<usize> = train.iter().map(|&i| labels[i]).collect();
        let mut clf = LogisticRegression::default();
        if clf.fit(&x, &y, 2).is_err() {
            continue;
        }
        for &i in &test {
            let p = clf.predict_proba(&vectorizer.transform_one(&docs[i]));
            scores.push(p.get(1).copied().unwrap_or(0.5));
            truth.push(labels[i] == 1);
        }
    }
    roc_auc(&scores, &truth).unwrap_or(0.5)
}

fn ks_feature(name: &str, reference: &[f64], current: &[f64], p_threshold: f64) -> FeatureDrift {
    let (d, p) = ks_two_sample(reference, current);
    FeatureDrift {
        feature: name.to_string(),
        stattest: "ks".to_string(),
        statistic: d,
        p_value: Some(p),
        threshold: p_threshold,
        drift_detected: p < p_threshold,
    }
}

/// Compute every monitored descriptor. Pure and CPU-bound.
pub fn compute_features(reference: &[String], current: &[String], policy: &DriftPolicy) -> Vec<FeatureDrift> {
    let auc = domain_classifier_auc(reference, current);
    let text_content = FeatureDrift {
        feature: "text_content".to_string(),
        stattest: "domain_classifier_roc_auc".to_string(),
        statistic: auc,
        p_value: None,
        threshold: policy.auc_threshold,
        drift_detected: auc > policy.auc_threshold,
    };

    let vocabulary: HashSet<String> = reference.iter().flat_map(|t| tokenize(t)).collect();
    let oov = |t: &String| {
        let tokens = tokenize(t);
        if tokens.is_empty() {
            0.0
        } else {
            tokens.iter().filter(|w| !vocabulary.contains(*w)).count() as f64 / tokens.len() as f64
        }
    };
    let length = |t: &String| t.chars().count() as f64;
    let words = |t: &String| t.split_whitespace().count() as f64;
    let non_letter = |t: &String| non_letter_share(t);

    let describe = |f: &dyn Fn(&String) -> f64| -> (Vec<f64>, Vec<f64>) {
        (reference.iter().map(f).collect(), current.iter().map(f).collect())
    };

    let descriptors: [(&str, &dyn Fn(&String) -> f64); 4] = [
        ("text_length", &length),
        ("word_count", &words),
        ("oov_share", &oov),
        ("non_letter_share", &non_letter),
    ];
    let mut features = vec![text_content];
    for (name, f) in descriptors {
        let (r, c) = describe(f);
        features.push(ks_feature(name, &r, &c, policy.p_value));
    }
    features
}

/// Production detector; optionally persists reports to the object store and
/// a local directory.
pub struct TextDriftDetector {
    policy: DriftPolicy,
    store: Option<Arc<dyn ObjectStore>>,
    reports_prefix: String,
    reports_dir: Option<PathBuf>,
}

impl TextDriftDetector {
    pub fn new(policy: DriftPolicy) -> Self {
        Self {
            policy,
            store: None,
            reports_prefix: "reports/".to_string(),
            reports_dir: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        self.store = Some(store);
        self.reports_prefix = prefix.into();
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn policy(&self) -> &DriftPolicy {
        &self.policy
    }

    /// Best effort; failures are logged.
    async fn persist(&self, assessment: &DriftAssessment) {
        let json = match serde_json::to_vec_pretty(assessment) {
            Ok(j) => j,
            Err(e) => {
                warn!(request_id = %assessment.request_id, error = %e, "Drift report serialization failed");
                return;
            }
        };
        let html = assessment.to_html().into_bytes();
        let stem = format!("drift_{}", assessment.request_id);

        if let Some(dir) = &self.reports_dir {
            let write = async {
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::write(dir.join(format!("{stem}.html")), &html).await?;
                tokio::fs::write(dir.join(format!("{stem}.json")), &json).await
            };
            if let Err(e) = write.await {
                warn!(dir = %dir.display(), error = %e, "Failed to write drift report locally");
            }
        }

        if let Some(store) = &self.store {
            for (ext, body, content_type) in [
                ("html", html, CONTENT_TYPE_HTML),
                ("json", json, CONTENT_TYPE_JSON),
            ] {
                let path = format!("{}{stem}.{ext}", self.reports_prefix);
                if let Err(e) = store.upload(&path, body, content_type).await {
                    warn!(path, error = %e, "Failed to upload drift report");
                }
            }
        }
    }
}

#[async_trait]
impl DriftDetector for TextDriftDetector {
    async fn assess(
        &self,
        reference: &[String],
        current: &[String],
        request_id: &str,
    ) -> Result<DriftAssessment> {
        if reference.is_empty() || current.is_empty() {
            return Err(MlError::drift(format!(
                "need non-empty samples (reference {}, current {})",
                reference.len(),
                current.len()
            )));
        }
        let policy = self.policy;
        let (r, c) = (reference.to_vec(), current.to_vec());
        let features = tokio::task::spawn_blocking(move || compute_features(&r, &c, &policy)).await?;

        let drifted = features.iter().filter(|f| f.drift_detected).count();
        let drift_share = (drifted as f64 / MONITORED_FEATURES as f64).clamp(0.0, 1.0);
        let assessment = DriftAssessment {
            request_id: request_id.to_string(),
            reference_id: snapshot_id(reference),
            current_id: snapshot_id(current),
            reference_rows: reference.len(),
            current_rows: current.len(),
            drift_share,
            threshold: self.policy.threshold,
            drift_detected: drift_share > self.policy.threshold,
            features,
            timestamp: Utc::now(),
        };
        debug!(request_id, features = ?assessment.features, "Drift descriptors computed");
        info!(
            request_id,
            drift_share,
            drift_detected = assessment.drift_detected,
            "Drift assessed"
        );
        self.persist(&assessment).await;
        Ok(assessment)
    }
}
