//! Experiment tracking and model registry: the narrow contract the lifecycle
//! core needs from a tracking backend, plus a local and an MLflow implementation.
//!
//! Every primitive is assumed atomic at single-call granularity. Aliases are
//! the only mutable registry state; runs and versions are append-only.

pub mod local;
pub mod mlflow;

pub use local::LocalTracking;
pub use mlflow::MlflowTracking;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag key carrying the human-readable run name.
pub const RUN_NAME_TAG: &str = "mlflow.runName";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

/// Immutable identity of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub artifact_uri: String,
}

/// Logged values of a run. Metrics keep the latest value per key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A tracked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    pub data: RunData,
}

impl Run {
    /// Value of a metric, if logged.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.data.metrics.get(key).copied()
    }
}

/// One version of a registered model; traces back to exactly one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    pub run_id: String,
    pub source: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

/// The tracking backend contract.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Resolve an experiment id by name, creating the experiment if needed.
    async fn get_or_create_experiment(&self, name: &str) -> Result<String>;

    /// Start a run under an experiment.
    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo>;

    /// Terminate a run.
    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Log one named metric value.
    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;

    /// Log one hyperparameter.
    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Set a run tag.
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Store an artifact under the run's artifact root.
    async fn log_artifact(&self, run_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Store a JSON document as an artifact.
    async fn log_dict(&self, run_id: &str, path: &str, value: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        self.log_artifact(run_id, path, &body).await
    }

    /// Fetch an artifact previously logged to a run.
    async fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>>;

    /// All runs of an experiment, newest first.
    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>>;

    /// A single run with its logged data.
    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// Register a new version of `name` produced by `run_id`.
    async fn create_model_version(&self, name: &str, run_id: &str, source: &str)
    -> Result<ModelVersion>;

    /// Versions (of any registered model) produced by `run_id`.
    async fn search_model_versions_by_run(&self, run_id: &str) -> Result<Vec<ModelVersion>>;

    /// Names of every registered model.
    async fn search_registered_models(&self) -> Result<Vec<String>>;

    /// The version currently holding `alias`, or `None` if the alias is unset.
    async fn get_model_version_by_alias(&self, name: &str, alias: &str)
    -> Result<Option<ModelVersion>>;

    /// Point `alias` at `version`, replacing any previous holder.
    async fn set_model_version_alias(&self, name: &str, alias: &str, version: &str) -> Result<()>;

    /// Point `alias` at `version` only if it is currently held by `expected`
    /// (`None` meaning unset). Returns whether the write happened.
    ///
    /// The default reads then writes and is therefore not atomic; backends
    /// with a native conditional update override it.
    async fn compare_and_set_alias(
        &self,
        name: &str,
        alias: &str,
        expected: Option<&str>,
        version: &str,
    ) -> Result<bool> {
        let current = self.get_model_version_by_alias(name, alias).await?;
        if current.as_ref().map(|v| v.version.as_str()) != expected {
            return Ok(false);
        }
        self.set_model_version_alias(name, alias, version).await?;
        Ok(true)
    }
}

/// Artifact location of a registered model inside its run.
pub fn model_source(artifact_uri: &str, artifact_path: &str) -> String {
    format!("{}/{}", artifact_uri.trim_end_matches('/'), artifact_path)
}
