//! Configuration system for the sentiment lifecycle service.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! deployment environment names -> `SENTIMENT_` prefixed environment.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default file name looked up in the working directory when no explicit
/// config file is passed.
pub const DEFAULT_CONFIG_FILE: &str = "sentiment-ops.toml";

/// Deployment environment variables understood without the `SENTIMENT_`
/// prefix, and the nested key each one maps to.
const DEPLOYMENT_ENV: &[(&str, &str)] = &[
    ("MLFLOW_TRACKING_URI", "tracking.uri"),
    ("GCS_BUCKET_NAME", "storage.bucket"),
    ("GCS_ENDPOINT", "storage.endpoint"),
    ("INITIAL_DATA_PATH", "training.initial_data_path"),
    ("REPORTS_DIR", "server.reports_dir"),
    ("FORCE_RETRAIN_ON_PREDICT", "retrain.force_on_predict"),
    ("BACKEND_URL", "retrain.notify_url"),
];

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Experiment tracking backend.
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Object storage for labeled data, predictions and reports.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Registered model naming and promotion policy.
    #[serde(default)]
    pub model: ModelConfig,
    /// Candidate training parameters.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Drift detection policy.
    #[serde(default)]
    pub drift: DriftConfig,
    /// HTTP serving.
    #[serde(default)]
    pub server: ServerConfig,
    /// Retraining triggers.
    #[serde(default)]
    pub retrain: RetrainConfig,
}

/// Experiment tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// MLflow tracking server URI. When unset, a local file-backed tracker is used.
    #[serde(default)]
    pub uri: Option<String>,
    /// Experiment every training run is logged under.
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    /// Root directory of the local tracker.
    #[serde(default = "default_tracking_dir")]
    pub local_dir: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: None,
            experiment_name: default_experiment_name(),
            local_dir: default_tracking_dir(),
        }
    }
}

fn default_experiment_name() -> String {
    "Sentiment_Analysis_Production".to_string()
}

fn default_tracking_dir() -> String {
    ".sentiment-ops/tracking".to_string()
}

/// Object storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket name.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// GCS-compatible JSON API endpoint. When unset, a local directory store is used.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Project used when the bucket has to be created.
    #[serde(default = "default_project")]
    pub project: String,
    /// Root directory of the local store.
    #[serde(default = "default_storage_dir")]
    pub local_dir: String,
    /// Prefix of labeled dataset snapshots.
    #[serde(default = "default_labeled_prefix")]
    pub labeled_prefix: String,
    /// Prefix of archived prediction batches.
    #[serde(default = "default_prediction_prefix")]
    pub prediction_prefix: String,
    /// Prefix of drift reports.
    #[serde(default = "default_reports_prefix")]
    pub reports_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            endpoint: None,
            project: default_project(),
            local_dir: default_storage_dir(),
            labeled_prefix: default_labeled_prefix(),
            prediction_prefix: default_prediction_prefix(),
            reports_prefix: default_reports_prefix(),
        }
    }
}

fn default_bucket() -> String {
    "mobile-reviews-bucket".to_string()
}

fn default_project() -> String {
    "test-project".to_string()
}

fn default_storage_dir() -> String {
    ".sentiment-ops/storage".to_string()
}

fn default_labeled_prefix() -> String {
    "data_label/labeled_".to_string()
}

fn default_prediction_prefix() -> String {
    "data_prediction/".to_string()
}

fn default_reports_prefix() -> String {
    "reports/".to_string()
}

/// Registered model naming and promotion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registered model every candidate version is created under.
    #[serde(default = "default_registered_name")]
    pub registered_name: String,
    /// Alias that marks the serving model.
    #[serde(default = "default_alias")]
    pub alias: String,
    /// Alias the previous production holder is moved to on promotion.
    #[serde(default = "default_staging_alias")]
    pub staging_alias: String,
    /// Metric candidates are ranked and compared by.
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
    /// Margin the candidate must exceed the production score by.
    /// Zero keeps the plain strict greater-than comparison.
    #[serde(default)]
    pub min_improvement: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            registered_name: default_registered_name(),
            alias: default_alias(),
            staging_alias: default_staging_alias(),
            primary_metric: default_primary_metric(),
            min_improvement: 0.0,
        }
    }
}

fn default_registered_name() -> String {
    "MobileSentimentModel".to_string()
}

fn default_alias() -> String {
    "Production".to_string()
}

fn default_staging_alias() -> String {
    "Staging".to_string()
}

fn default_primary_metric() -> String {
    "macro_f1".to_string()
}

/// Candidate training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Bootstrap dataset used when no labeled snapshot exists yet.
    #[serde(default = "default_initial_data_path")]
    pub initial_data_path: PathBuf,
    /// Fraction of rows held out for validation.
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    /// Seed for splitting and stochastic learners.
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    /// TF-IDF vocabulary cap for bootstrap training.
    #[serde(default = "default_max_features")]
    pub max_features: usize,
    /// TF-IDF vocabulary cap for scheduled, drift and manual retrains.
    #[serde(default = "default_retrain_max_features")]
    pub retrain_max_features: usize,
    /// Candidate family keys, trained in this order.
    #[serde(default = "default_families")]
    pub families: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            initial_data_path: default_initial_data_path(),
            test_size: default_test_size(),
            random_state: default_random_state(),
            max_features: default_max_features(),
            retrain_max_features: default_retrain_max_features(),
            families: default_families(),
        }
    }
}

fn default_initial_data_path() -> PathBuf {
    PathBuf::from("data/mobile-reviews.csv")
}

fn default_test_size() -> f64 {
    0.5
}

fn default_random_state() -> u64 {
    42
}

fn default_max_features() -> usize {
    300
}

fn default_retrain_max_features() -> usize {
    100
}

fn default_families() -> Vec<String> {
    ["lr", "nb", "rf", "xgb"].iter().map(|s| s.to_string()).collect()
}

/// Drift detection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Whether batch predictions run a drift check at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Drift share above which a batch counts as drifted.
    #[serde(default = "default_drift_threshold")]
    pub threshold: f64,
    /// Held-out ROC AUC above which the text domain classifier flags drift.
    #[serde(default = "default_text_auc_threshold")]
    pub text_auc_threshold: f64,
    /// KS p-value below which a numeric descriptor flags drift.
    #[serde(default = "default_p_value")]
    pub p_value: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_drift_threshold(),
            text_auc_threshold: default_text_auc_threshold(),
            p_value: default_p_value(),
        }
    }
}

fn default_drift_threshold() -> f64 {
    0.5
}

fn default_text_auc_threshold() -> f64 {
    0.55
}

fn default_p_value() -> f64 {
    0.05
}

/// HTTP serving configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory drift reports are written to and served from under `/reports`.
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    /// Maximum accepted upload size in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reports_dir: default_reports_dir(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("report")
}

fn default_max_upload_mb() -> usize {
    32
}

/// Retraining trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// Cron expression (seconds first) for scheduled retraining. `None` disables it.
    #[serde(default = "default_schedule")]
    pub schedule: Option<String>,
    /// Reject a trigger while another retrain is in flight.
    #[serde(default = "default_true")]
    pub single_flight: bool,
    /// Schedule a retrain after every batch prediction regardless of drift.
    #[serde(default)]
    pub force_on_predict: bool,
    /// URL pinged with a GET after a promotion (e.g. another replica's `/loadmodel`).
    #[serde(default)]
    pub notify_url: Option<String>,
    /// Train and promote from the bootstrap dataset when no production model exists at startup.
    #[serde(default = "default_true")]
    pub bootstrap_on_startup: bool,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            single_flight: true,
            force_on_predict: false,
            notify_url: None,
            bootstrap_on_startup: true,
        }
    }
}

fn default_schedule() -> Option<String> {
    Some("0 0 0 * * *".to_string())
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables prefixed with `SENTIMENT_` (`SENTIMENT_MODEL__ALIAS`, ...)
/// 2. Deployment environment names (`MLFLOW_TRACKING_URI`, `GCS_BUCKET_NAME`, ...)
/// 3. The explicit config file, or `./sentiment-ops.toml` if present
/// 4. Built-in defaults
pub fn load_config(config_file: Option<&Path>) -> Result<ServiceConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

    match config_file {
        Some(path) => figment = figment.merge(Toml::file(path)),
        None => {
            let local = Path::new(DEFAULT_CONFIG_FILE);
            if local.exists() {
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    let names: Vec<&'static str> = DEPLOYMENT_ENV.iter().map(|(name, _)| *name).collect();
    figment = figment.merge(Env::raw().only(&names).map(|key| {
        DEPLOYMENT_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, nested)| (*nested).into())
            .unwrap_or_else(|| key.as_str().into())
    }));

    figment = figment.merge(Env::prefixed("SENTIMENT_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.model.registered_name, "MobileSentimentModel");
        assert_eq!(config.model.alias, "Production");
        assert_eq!(config.model.staging_alias, "Staging");
        assert_eq!(config.model.primary_metric, "macro_f1");
        assert_eq!(config.drift.threshold, 0.5);
        assert_eq!(config.training.test_size, 0.5);
        assert_eq!(config.training.families, vec!["lr", "nb", "rf", "xgb"]);
        assert_eq!(config.storage.labeled_prefix, "data_label/labeled_");
        assert!(config.retrain.single_flight);
        assert!(!config.retrain.force_on_predict);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ServiceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.retrain.schedule, config.retrain.schedule);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[model]
registered_name = "ReviewSentiment"
min_improvement = 0.01

[drift]
threshold = 0.4

[training]
families = ["lr", "rf"]
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.model.registered_name, "ReviewSentiment");
        assert_eq!(config.model.alias, "Production");
        assert_eq!(config.model.min_improvement, 0.01);
        assert_eq!(config.drift.threshold, 0.4);
        assert_eq!(config.training.families, vec!["lr", "rf"]);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let parsed: ServiceConfig = serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.server.host, "0.0.0.0");
        assert_eq!(parsed.tracking.experiment_name, "Sentiment_Analysis_Production");
    }
}
