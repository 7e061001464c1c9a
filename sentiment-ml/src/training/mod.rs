//! Candidate training: one tracked run per model family, each producing a
//! fitted pipeline artifact, its label encoder, run metadata and a registered
//! model version.

pub mod orchestrator;

pub use orchestrator::{
    ModelReloader, OrchestratorSettings, RetrainAck, RetrainOrchestrator, RetrainReport,
    RetrainState, RetrainTrigger,
};

use crate::data::{Dataset, stratified_split};
use crate::error::{MlError, Result};
use crate::eval::evaluate_model;
use crate::models::ModelFamily;
use crate::pipeline::{SentimentPipeline, TrainingParams, build_pipelines};
use sentiment_core::tracking::{RunStatus, model_source};
use sentiment_core::{ModelVersion, TrackingBackend};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Run tag holding the family key ("lr", "nb", ...).
pub const MODEL_KEY_TAG: &str = "model_key";

/// Directory of the serialized pipeline inside a run's artifacts.
pub fn model_artifact_dir(key: &str) -> String {
    format!("{key}_model")
}

pub fn model_artifact_path(key: &str) -> String {
    format!("{key}_model/model.json")
}

pub fn label_encoder_artifact(key: &str) -> String {
    format!("{key}__label_encoder.json")
}

pub fn metadata_artifact(key: &str) -> String {
    format!("{key}__metadata.json")
}

/// A finished candidate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub family: ModelFamily,
    pub run_id: String,
    pub run_name: String,
    pub hyperparams: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// Index `i` is class id `i`.
    pub labels: Vec<String>,
    pub artifact_path: String,
    pub model_version: Option<ModelVersion>,
}

impl TrainingRun {
    pub fn score(&self, metric: &str) -> f64 {
        self.metrics.get(metric).copied().unwrap_or(0.0)
    }
}

/// The candidate with the highest `metric`. Earlier candidates win ties.
pub fn select_best<'a>(runs: &'a [TrainingRun], metric: &str) -> Option<&'a TrainingRun> {
    let mut best: Option<&TrainingRun> = None;
    for run in runs {
        if best.is_none_or(|b| run.score(metric) > b.score(metric)) {
            best = Some(run);
        }
    }
    best
}

pub struct Trainer {
    tracker: Arc<dyn TrackingBackend>,
    experiment_name: String,
    registered_name: String,
}

impl Trainer {
    pub fn new(
        tracker: Arc<dyn TrackingBackend>,
        experiment_name: impl Into<String>,
        registered_name: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            experiment_name: experiment_name.into(),
            registered_name: registered_name.into(),
        }
    }

    pub fn registered_name(&self) -> &str {
        &self.registered_name
    }

    /// Train every configured family in catalog order. A failing candidate
    /// is recorded as a failed run and skipped; only an all-failed round is
    /// an error.
    pub async fn train_candidates(
        &self,
        dataset: &Dataset,
        params: &TrainingParams,
    ) -> Result<Vec<TrainingRun>> {
        let split = Arc::new(stratified_split(dataset, params.test_size, params.random_state)?);
        info!(
            train = split.train_texts.len(),
            valid = split.valid_texts.len(),
            classes = split.n_classes(),
            "Prepared train/validation split"
        );
        let experiment_id = self
            .tracker
            .get_or_create_experiment(&self.experiment_name)
            .await?;

        let mut runs = Vec::new();
        let mut last_error = None;
        for pipeline in build_pipelines(params) {
            let family = pipeline.family();
            match self
                .train_one(&experiment_id, pipeline, Arc::clone(&split), params)
                .await
            {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(model = family.display_name(), error = %e, "Candidate training failed");
                    last_error = Some(e);
                }
            }
        }
        if runs.is_empty() {
            return Err(MlError::training(match last_error {
                Some(e) => format!("every candidate failed, last error: {e}"),
                None => "no model families configured".to_string(),
            }));
        }
        Ok(runs)
    }

    async fn train_one(
        &self,
        experiment_id: &str,
        pipeline: SentimentPipeline,
        split: Arc<crate::data::Split>,
        params: &TrainingParams,
    ) -> Result<TrainingRun> {
        let family = pipeline.family();
        let name = family.display_name();
        let run = self.tracker.start_run(experiment_id, name).await?;
        let run_id = run.run_id.clone();

        let result = self
            .fit_and_log(&run_id, &run.artifact_uri, pipeline, split, params)
            .await;
        let status = if result.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = self.tracker.end_run(&run_id, status).await {
            warn!(run_id = %run_id, error = %e, "Failed to close run");
        }
        let run = result?;
        info!(
            run_id = %run.run_id,
            model = name,
            macro_f1 = run.score("macro_f1"),
            version = run.model_version.as_ref().map(|v| v.version.as_str()),
            "Trained candidate"
        );
        Ok(run)
    }

    async fn fit_and_log(
        &self,
        run_id: &str,
        artifact_uri: &str,
        pipeline: SentimentPipeline,
        split: Arc<crate::data::Split>,
        params: &TrainingParams,
    ) -> Result<TrainingRun> {
        let family = pipeline.family();
        let (key, name) = (family.key(), family.display_name());
        self.tracker.set_tag(run_id, MODEL_KEY_TAG, key).await?;

        let hyperparams = pipeline.hyperparams();
        for (k, v) in &hyperparams {
            self.tracker.log_param(run_id, k, v).await?;
        }
        self.tracker
            .log_param(run_id, "test_size", &params.test_size.to_string())
            .await?;
        self.tracker
            .log_param(run_id, "random_state", &params.random_state.to_string())
            .await?;

        let encoder = split.encoder.clone();
        let evaluation = evaluate_model(pipeline, split, name, self.tracker.as_ref(), run_id).await?;

        let clf_params: BTreeMap<&str, &String> = hyperparams
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("clf__").map(|k| (k, v)))
            .collect();
        let metadata = json!({
            "model_name": name,
            "registered_model_name": self.registered_name,
            "tfidf": {
                "max_features": params.max_features,
                "ngram_range": [params.ngram_range.0, params.ngram_range.1],
                "min_df": params.min_df,
            },
            "params_specific": clf_params,
            "data": {
                "test_size": params.test_size,
                "random_state": params.random_state,
            },
            "labels": { "id_to_label": encoder.id_to_label() },
            "metrics": evaluation.metrics,
        });
        self.tracker
            .log_dict(run_id, &metadata_artifact(key), &metadata)
            .await?;
        self.tracker
            .log_dict(run_id, &label_encoder_artifact(key), &serde_json::to_value(&encoder)?)
            .await?;
        self.tracker
            .log_artifact(run_id, &model_artifact_path(key), &evaluation.pipeline.to_json()?)
            .await?;

        let source = model_source(artifact_uri, &model_artifact_dir(key));
        let model_version = match self
            .tracker
            .create_model_version(&self.registered_name, run_id, &source)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(run_id, model = name, error = %e, "Model registration failed");
                None
            }
        };

        Ok(TrainingRun {
            family,
            run_id: run_id.to_string(),
            run_name: name.to_string(),
            hyperparams,
            metrics: evaluation.metrics,
            labels: encoder.classes().to_vec(),
            artifact_path: model_artifact_path(key),
            model_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelEncoder;
    use pretty_assertions::assert_eq;
    use sentiment_core::LocalTracking;

    fn dataset() -> Dataset {
        let mut ds = Dataset::default();
        for i in 0..10 {
            ds.texts.push(format!("great phone love battery fast{}", i % 2));
            ds.labels.push("positive".into());
            ds.texts.push(format!("awful screen broken refund slow{}", i % 2));
            ds.labels.push("negative".into());
        }
        ds
    }

    fn run(family: ModelFamily, macro_f1: f64) -> TrainingRun {
        TrainingRun {
            family,
            run_id: family.key().into(),
            run_name: family.display_name().into(),
            hyperparams: BTreeMap::new(),
            metrics: BTreeMap::from([("macro_f1".to_string(), macro_f1)]),
            labels: vec![],
            artifact_path: model_artifact_path(family.key()),
            model_version: None,
        }
    }

    #[test]
    fn test_select_best_first_strictly_greater() {
        let runs = vec![
            run(ModelFamily::LogisticRegression, 0.62),
            run(ModelFamily::NaiveBayes, 0.71),
            run(ModelFamily::RandomForest, 0.71),
        ];
        assert_eq!(select_best(&runs, "macro_f1").unwrap().run_id, "nb");
        assert!(select_best(&[], "macro_f1").is_none());
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(model_artifact_path("lr"), "lr_model/model.json");
        assert_eq!(label_encoder_artifact("nb"), "nb__label_encoder.json");
        assert_eq!(metadata_artifact("xgb"), "xgb__metadata.json");
    }

    #[tokio::test]
    async fn test_train_candidates_logs_and_registers() {
        let tracker: Arc<dyn TrackingBackend> = Arc::new(LocalTracking::in_memory());
        let trainer = Trainer::new(Arc::clone(&tracker), "sentiment", "MobileSentimentModel");
        let params = TrainingParams {
            families: vec![ModelFamily::LogisticRegression, ModelFamily::NaiveBayes],
            ..TrainingParams::default()
        };
        let runs = trainer.train_candidates(&dataset(), &params).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_name, "LogisticRegression");
        assert_eq!(runs[0].labels, vec!["negative".to_string(), "positive".to_string()]);

        let lr = &runs[0];
        let logged = tracker.get_run(&lr.run_id).await.unwrap();
        assert_eq!(logged.info.status, RunStatus::Finished);
        assert_eq!(logged.data.tags.get(MODEL_KEY_TAG).map(String::as_str), Some("lr"));
        assert!(logged.data.params.contains_key("clf__C"));

        let bytes = tracker
            .download_artifact(&lr.run_id, &model_artifact_path("lr"))
            .await
            .unwrap();
        let pipeline = SentimentPipeline::from_json(&bytes).unwrap();
        assert!(pipeline.is_fitted());

        let enc = tracker
            .download_artifact(&lr.run_id, &label_encoder_artifact("lr"))
            .await
            .unwrap();
        let enc: LabelEncoder = serde_json::from_slice(&enc).unwrap();
        assert_eq!(enc.classes(), lr.labels.as_slice());

        let meta = tracker
            .download_artifact(&lr.run_id, &metadata_artifact("lr"))
            .await
            .unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&meta).unwrap();
        assert_eq!(meta["labels"]["id_to_label"]["0"], "negative");
        assert_eq!(meta["registered_model_name"], "MobileSentimentModel");

        let versions: Vec<String> = runs
            .iter()
            .filter_map(|r| r.model_version.as_ref().map(|v| v.version.clone()))
            .collect();
        assert_eq!(versions, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_train_candidates_rejects_tiny_dataset() {
        let tracker: Arc<dyn TrackingBackend> = Arc::new(LocalTracking::in_memory());
        let trainer = Trainer::new(tracker, "sentiment", "MobileSentimentModel");
        let ds = Dataset {
            texts: vec!["great".into(), "awful".into()],
            labels: vec!["positive".into(), "negative".into()],
        };
        assert!(trainer.train_candidates(&ds, &TrainingParams::default()).await.is_err());
    }
}
