//! File-backed tracking backend.
//!
//! Keeps experiments, runs and the model registry in a single JSON state file
//! and artifacts in a directory tree under the same root. With no root the
//! backend is purely in-memory, which is what the test suites use.

use super::{ModelVersion, Run, RunData, RunInfo, RunStatus, TrackingBackend};
use crate::error::{CoreError, Result};
use crate::persistence::{SnapshotWriter, load_json, write_blocking};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const STATE_FILE: &str = "tracking.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExperimentRecord {
    experiment_id: String,
    name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegisteredModel {
    versions: Vec<ModelVersion>,
    /// alias -> version
    aliases: BTreeMap<String, String>,
}

impl RegisteredModel {
    fn with_aliases(&self, version: &ModelVersion) -> ModelVersion {
        let mut v = version.clone();
        v.aliases = self
            .aliases
            .iter()
            .filter(|(_, held)| **held == v.version)
            .map(|(alias, _)| alias.clone())
            .collect();
        v
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackingState {
    experiments: Vec<ExperimentRecord>,
    /// Insertion order is creation order.
    runs: Vec<Run>,
    models: BTreeMap<String, RegisteredModel>,
    #[serde(skip)]
    artifacts: HashMap<(String, String), Vec<u8>>,
    /// Bumped on every persisted mutation.
    #[serde(skip)]
    revision: u64,
}

impl TrackingState {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut Run> {
        self.runs
            .iter_mut()
            .find(|r| r.info.run_id == run_id)
            .ok_or_else(|| CoreError::not_found(format!("run {run_id}")))
    }
}

/// Tracking backend stored on local disk (or in memory).
///
/// State changes happen under a short synchronous lock; the state file is
/// written after the lock is released.
pub struct LocalTracking {
    root: Option<PathBuf>,
    state: Mutex<TrackingState>,
    writer: Option<SnapshotWriter>,
}

impl LocalTracking {
    /// Open (or create) a tracker rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let state: TrackingState = load_json(&root.join(STATE_FILE))?.unwrap_or_default();
        debug!(root = %root.display(), runs = state.runs.len(), "Opened local tracking store");
        Ok(Self {
            writer: Some(SnapshotWriter::new(root.join(STATE_FILE))),
            root: Some(root),
            state: Mutex::new(state),
        })
    }

    /// A tracker that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            state: Mutex::new(TrackingState::default()),
            writer: None,
        }
    }

    fn artifact_path(root: &Path, run_id: &str, path: &str) -> PathBuf {
        root.join("artifacts").join(run_id).join(path)
    }

    /// Run `f` against the state under the lock, then persist a snapshot of
    /// the result outside it.
    async fn mutate<T>(&self, f: impl FnOnce(&mut TrackingState) -> Result<T>) -> Result<T> {
        let (out, snapshot) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CoreError::tracking("tracking state lock poisoned"))?;
            let out = f(&mut state)?;
            let snapshot = match self.writer {
                Some(_) => {
                    state.revision += 1;
                    Some((state.revision, SnapshotWriter::encode(&*state)?))
                }
                None => None,
            };
            (out, snapshot)
        };
        if let (Some(writer), Some((revision, bytes))) = (&self.writer, snapshot) {
            writer.write(revision, bytes).await?;
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&TrackingState) -> Result<T>) -> Result<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| CoreError::tracking("tracking state lock poisoned"))?;
        f(&state)
    }
}

#[async_trait]
impl TrackingBackend for LocalTracking {
    fn name(&self) -> &str {
        "local"
    }

    async fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        self.mutate(|state| {
            if let Some(exp) = state.experiments.iter().find(|e| e.name == name) {
                return Ok(exp.experiment_id.clone());
            }
            let id = state.experiments.len().to_string();
            state.experiments.push(ExperimentRecord {
                experiment_id: id.clone(),
                name: name.to_string(),
            });
            Ok(id)
        })
        .await
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let artifact_uri = match &self.root {
            Some(root) => format!("file://{}", root.join("artifacts").join(&run_id).display()),
            None => format!("memory://{run_id}/artifacts"),
        };
        let info = RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            artifact_uri,
        };
        self.mutate(|state| {
            if !state.experiments.iter().any(|e| e.experiment_id == experiment_id) {
                return Err(CoreError::not_found(format!("experiment {experiment_id}")));
            }
            let mut data = RunData::default();
            data.tags
                .insert(super::RUN_NAME_TAG.to_string(), run_name.to_string());
            state.runs.push(Run {
                info: info.clone(),
                data,
            });
            Ok(())
        })
        .await?;
        Ok(info)
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            run.info.status = status;
            run.info.end_time = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        self.mutate(|state| {
            state
                .run_mut(run_id)?
                .data
                .metrics
                .insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|state| {
            state
                .run_mut(run_id)?
                .data
                .params
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|state| {
            state
                .run_mut(run_id)?
                .data
                .tags
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    async fn log_artifact(&self, run_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.read(|state| {
            state
                .runs
                .iter()
                .any(|r| r.info.run_id == run_id)
                .then_some(())
                .ok_or_else(|| CoreError::not_found(format!("run {run_id}")))
        })?;
        match &self.root {
            Some(root) => {
                write_blocking(Self::artifact_path(root, run_id, path), contents.to_vec()).await?;
            }
            None => {
                self.mutate(|state| {
                    state
                        .artifacts
                        .insert((run_id.to_string(), path.to_string()), contents.to_vec());
                    Ok(())
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
        match &self.root {
            Some(root) => {
                let file = Self::artifact_path(root, run_id, path);
                match tokio::fs::read(&file).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                        CoreError::not_found(format!("artifact {path} of run {run_id}")),
                    ),
                    Err(e) => Err(e.into()),
                }
            }
            None => self.read(|state| {
                state
                    .artifacts
                    .get(&(run_id.to_string(), path.to_string()))
                    .cloned()
                    .ok_or_else(|| CoreError::not_found(format!("artifact {path} of run {run_id}")))
            }),
        }
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>> {
        self.read(|state| {
            Ok(state
                .runs
                .iter()
                .rev()
                .filter(|r| r.info.experiment_id == experiment_id)
                .cloned()
                .collect())
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.read(|state| {
            state
                .runs
                .iter()
                .find(|r| r.info.run_id == run_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("run {run_id}")))
        })
    }

    async fn create_model_version(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion> {
        self.mutate(|state| {
            if !state.runs.iter().any(|r| r.info.run_id == run_id) {
                return Err(CoreError::not_found(format!("run {run_id}")));
            }
            let model = state.models.entry(name.to_string()).or_default();
            let version = ModelVersion {
                name: name.to_string(),
                version: (model.versions.len() + 1).to_string(),
                run_id: run_id.to_string(),
                source: source.to_string(),
                aliases: Vec::new(),
                creation_time: Some(Utc::now()),
            };
            model.versions.push(version.clone());
            Ok(version)
        })
        .await
    }

    async fn search_model_versions_by_run(&self, run_id: &str) -> Result<Vec<ModelVersion>> {
        self.read(|state| {
            Ok(state
                .models
                .values()
                .flat_map(|m| {
                    m.versions
                        .iter()
                        .filter(|v| v.run_id == run_id)
                        .map(|v| m.with_aliases(v))
                })
                .collect())
        })
    }

    async fn search_registered_models(&self) -> Result<Vec<String>> {
        self.read(|state| Ok(state.models.keys().cloned().collect()))
    }

    async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<Option<ModelVersion>> {
        self.read(|state| {
            let Some(model) = state.models.get(name) else {
                return Ok(None);
            };
            let Some(held) = model.aliases.get(alias) else {
                return Ok(None);
            };
            Ok(model
                .versions
                .iter()
                .find(|v| &v.version == held)
                .map(|v| model.with_aliases(v)))
        })
    }

    async fn set_model_version_alias(&self, name: &str, alias: &str, version: &str) -> Result<()> {
        self.mutate(|state| {
            let model = state
                .models
                .get_mut(name)
                .ok_or_else(|| CoreError::not_found(format!("registered model {name}")))?;
            if !model.versions.iter().any(|v| v.version == version) {
                return Err(CoreError::not_found(format!("{name} version {version}")));
            }
            model.aliases.insert(alias.to_string(), version.to_string());
            Ok(())
        })
        .await
    }

    async fn compare_and_set_alias(
        &self,
        name: &str,
        alias: &str,
        expected: Option<&str>,
        version: &str,
    ) -> Result<bool> {
        self.mutate(|state| {
            let model = state
                .models
                .get_mut(name)
                .ok_or_else(|| CoreError::not_found(format!("registered model {name}")))?;
            if !model.versions.iter().any(|v| v.version == version) {
                return Err(CoreError::not_found(format!("{name} version {version}")));
            }
            if model.aliases.get(alias).map(String::as_str) != expected {
                return Ok(false);
            }
            model.aliases.insert(alias.to_string(), version.to_string());
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn registered(tracker: &LocalTracking, name: &str) -> (String, ModelVersion) {
        let exp = tracker.get_or_create_experiment("exp").await.unwrap();
        let run = tracker.start_run(&exp, "lr_model").await.unwrap();
        let v = tracker
            .create_model_version(name, &run.run_id, "memory://model")
            .await
            .unwrap();
        (run.run_id, v)
    }

    #[tokio::test]
    async fn test_experiment_is_reused_by_name() {
        let tracker = LocalTracking::in_memory();
        let a = tracker.get_or_create_experiment("exp").await.unwrap();
        let b = tracker.get_or_create_experiment("exp").await.unwrap();
        let c = tracker.get_or_create_experiment("other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_run_logging_and_search_order() {
        let tracker = LocalTracking::in_memory();
        let exp = tracker.get_or_create_experiment("exp").await.unwrap();
        let first = tracker.start_run(&exp, "lr_model").await.unwrap();
        let second = tracker.start_run(&exp, "nb_model").await.unwrap();
        tracker.log_metric(&first.run_id, "macro_f1", 0.7).await.unwrap();
        tracker.log_param(&first.run_id, "C", "2.0").await.unwrap();
        tracker.end_run(&first.run_id, RunStatus::Finished).await.unwrap();

        let runs = tracker.search_runs(&exp).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].info.run_id, second.run_id);

        let run = tracker.get_run(&first.run_id).await.unwrap();
        assert_eq!(run.metric("macro_f1"), Some(0.7));
        assert_eq!(run.data.params["C"], "2.0");
        assert_eq!(run.info.status, RunStatus::Finished);
        assert!(run.info.end_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let tracker = LocalTracking::in_memory();
        let err = tracker.log_metric("missing", "accuracy", 1.0).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let tracker = LocalTracking::in_memory();
        let (run_id, v) = registered(&tracker, "Model").await;
        assert!(tracker
            .get_model_version_by_alias("Model", "Production")
            .await
            .unwrap()
            .is_none());

        tracker
            .set_model_version_alias("Model", "Production", &v.version)
            .await
            .unwrap();
        let holder = tracker
            .get_model_version_by_alias("Model", "Production")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.run_id, run_id);
        assert_eq!(holder.aliases, vec!["Production".to_string()]);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_expectation() {
        let tracker = LocalTracking::in_memory();
        let (_, v1) = registered(&tracker, "Model").await;
        let (_, v2) = registered(&tracker, "Model").await;
        assert_eq!(v2.version, "2");

        assert!(tracker
            .compare_and_set_alias("Model", "Production", None, &v1.version)
            .await
            .unwrap());
        assert!(!tracker
            .compare_and_set_alias("Model", "Production", None, &v2.version)
            .await
            .unwrap());
        assert!(tracker
            .compare_and_set_alias("Model", "Production", Some("1"), &v2.version)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_state_and_artifacts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let run_id = {
            let tracker = LocalTracking::open(dir.path()).unwrap();
            let (run_id, v) = registered(&tracker, "Model").await;
            tracker
                .set_model_version_alias("Model", "Production", &v.version)
                .await
                .unwrap();
            tracker
                .log_artifact(&run_id, "lr_model/model.json", b"{\"k\":1}")
                .await
                .unwrap();
            run_id
        };

        let tracker = LocalTracking::open(dir.path()).unwrap();
        let holder = tracker
            .get_model_version_by_alias("Model", "Production")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.run_id, run_id);
        let bytes = tracker
            .download_artifact(&run_id, "lr_model/model.json")
            .await
            .unwrap();
        assert_eq!(bytes, b"{\"k\":1}".to_vec());
        assert_eq!(tracker.search_registered_models().await.unwrap(), vec!["Model"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_reach_disk() {
        let dir = TempDir::new().unwrap();
        let tracker = std::sync::Arc::new(LocalTracking::open(dir.path()).unwrap());
        let exp = tracker.get_or_create_experiment("exp").await.unwrap();
        let run = tracker.start_run(&exp, "lr_model").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..24 {
            let tracker = std::sync::Arc::clone(&tracker);
            let run_id = run.run_id.clone();
            handles.push(tokio::spawn(async move {
                tracker
                    .log_metric(&run_id, &format!("m{i}"), i as f64)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        drop(tracker);

        let reopened = LocalTracking::open(dir.path()).unwrap();
        let logged = reopened.get_run(&run.run_id).await.unwrap();
        assert_eq!(logged.data.metrics.len(), 24);
        assert_eq!(logged.metric("m23"), Some(23.0));
    }

    #[tokio::test]
    async fn test_log_dict_roundtrip_in_memory() {
        let tracker = LocalTracking::in_memory();
        let (run_id, _) = registered(&tracker, "Model").await;
        tracker
            .log_dict(&run_id, "report.json", &serde_json::json!({"accuracy": 0.5}))
            .await
            .unwrap();
        let bytes = tracker.download_artifact(&run_id, "report.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["accuracy"], 0.5);
    }
}
