//! The served production model: a single swappable slot plus the loader that
//! resolves the production alias into a ready-to-predict pipeline.

use crate::error::{MlError, Result};
use crate::labels::LabelEncoder;
use crate::models::ModelFamily;
use crate::pipeline::SentimentPipeline;
use crate::training::orchestrator::{ModelReloader, RetrainOrchestrator};
use crate::training::{MODEL_KEY_TAG, label_encoder_artifact, model_artifact_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sentiment_core::tracking::RUN_NAME_TAG;
use sentiment_core::{ModelVersion, Run, TrackingBackend};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// A production pipeline with everything needed to answer requests.
#[derive(Debug)]
pub struct LoadedModel {
    pub pipeline: SentimentPipeline,
    pub encoder: LabelEncoder,
    pub version: ModelVersion,
    pub family: ModelFamily,
    pub metrics: BTreeMap<String, f64>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    pub probabilities: BTreeMap<String, f64>,
}

impl LoadedModel {
    /// Decoded labels for a batch, falling back to the class id when the
    /// encoder does not know it.
    pub fn predict_labels<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<String>> {
        Ok(self
            .pipeline
            .predict_batch(texts)?
            .into_iter()
            .map(|id| self.encoder.decode_or_id(id))
            .collect())
    }

    pub fn predict_one(&self, text: &str) -> Result<Prediction> {
        let proba = self
            .pipeline
            .predict_proba_batch(&[text])?
            .pop()
            .unwrap_or_default();
        let best = crate::models::argmax(&proba);
        Ok(Prediction {
            label: self.encoder.decode_or_id(best),
            confidence: proba.get(best).copied().unwrap_or(0.0),
            probabilities: proba
                .iter()
                .enumerate()
                .map(|(i, p)| (self.encoder.decode_or_id(i), *p))
                .collect(),
        })
    }
}

/// Resolves the production alias and builds a [`LoadedModel`].
pub struct ProductionLoader {
    tracker: Arc<dyn TrackingBackend>,
    registered_name: String,
    alias: String,
}

impl ProductionLoader {
    pub fn new(
        tracker: Arc<dyn TrackingBackend>,
        registered_name: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            registered_name: registered_name.into(),
            alias: alias.into(),
        }
    }

    /// The configured registered model's holder first, then any other
    /// registered model holding the alias.
    async fn resolve(&self) -> Result<ModelVersion> {
        if let Some(v) = self
            .tracker
            .get_model_version_by_alias(&self.registered_name, &self.alias)
            .await?
        {
            return Ok(v);
        }
        for name in self.tracker.search_registered_models().await? {
            if name == self.registered_name {
                continue;
            }
            match self.tracker.get_model_version_by_alias(&name, &self.alias).await {
                Ok(Some(v)) => {
                    info!(registered_name = %name, version = %v.version, "Using alias holder from another registered model");
                    return Ok(v);
                }
                Ok(None) => {}
                Err(e) => warn!(registered_name = %name, error = %e, "Alias lookup failed"),
            }
        }
        Err(MlError::model(format!("no registered model holds alias '{}'", self.alias)))
    }

    fn family_of(run: &Run) -> Result<ModelFamily> {
        let tags = &run.data.tags;
        tags.get(MODEL_KEY_TAG)
            .and_then(|k| ModelFamily::from_key(k))
            .or_else(|| tags.get(RUN_NAME_TAG).and_then(|n| ModelFamily::from_key(n)))
            .or_else(|| ModelFamily::from_key(&run.info.run_name))
            .ok_or_else(|| {
                MlError::model(format!(
                    "cannot tell the model family of run {}",
                    run.info.run_id
                ))
            })
    }

    pub async fn load(&self) -> Result<LoadedModel> {
        let version = self.resolve().await?;
        let run = self.tracker.get_run(&version.run_id).await?;
        let family = Self::family_of(&run)?;
        let key = family.key();

        let bytes = self
            .tracker
            .download_artifact(&version.run_id, &model_artifact_path(key))
            .await?;
        let pipeline = tokio::task::spawn_blocking(move || SentimentPipeline::from_json(&bytes)).await??;

        let encoder = match self
            .tracker
            .download_artifact(&version.run_id, &label_encoder_artifact(key))
            .await
            .map_err(MlError::from)
            .and_then(|b| Ok(serde_json::from_slice::<LabelEncoder>(&b)?))
        {
            Ok(enc) => enc,
            Err(e) => {
                warn!(run_id = %version.run_id, error = %e, "Label encoder unavailable, predictions fall back to class ids");
                LabelEncoder::default()
            }
        };

        info!(
            registered_name = %version.name,
            version = %version.version,
            run_id = %version.run_id,
            model = family.display_name(),
            "Loaded production model"
        );
        Ok(LoadedModel {
            pipeline,
            encoder,
            version,
            family,
            metrics: run.data.metrics,
            loaded_at: Utc::now(),
        })
    }
}

/// The single served-model slot. Readers clone the `Arc` and drop the lock;
/// a reload replaces the whole `Arc`.
pub struct ServingState {
    slot: RwLock<Option<Arc<LoadedModel>>>,
    loader: ProductionLoader,
}

impl ServingState {
    pub fn new(loader: ProductionLoader) -> Self {
        Self {
            slot: RwLock::new(None),
            loader,
        }
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, model: Arc<LoadedModel>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Resolve the production alias again and swap it in. On failure the
    /// previous model keeps serving.
    pub async fn reload_production(&self) -> Result<Arc<LoadedModel>> {
        let model = Arc::new(self.loader.load().await?);
        self.replace(Arc::clone(&model));
        Ok(model)
    }
}

#[async_trait]
impl ModelReloader for ServingState {
    async fn reload(&self) -> Result<()> {
        self.reload_production().await.map(|_| ())
    }
}

/// Load production; when that fails, bootstrap and try once more. The
/// service keeps running without a model if both attempts fail.
pub async fn startup(
    serving: &ServingState,
    orchestrator: &RetrainOrchestrator,
    bootstrap_on_startup: bool,
) -> Option<Arc<LoadedModel>> {
    match serving.reload_production().await {
        Ok(model) => return Some(model),
        Err(e) => warn!(error = %e, "No production model at startup"),
    }
    if !bootstrap_on_startup {
        warn!("Bootstrap disabled, serving without a model");
        return None;
    }
    match orchestrator.bootstrap().await {
        Ok(report) if report.succeeded() => info!(job_id = %report.job_id, "Bootstrap finished"),
        Ok(report) => warn!(error = ?report.error, "Bootstrap failed"),
        Err(e) => warn!(error = %e, "Bootstrap not started"),
    }
    if let Some(model) = serving.current() {
        return Some(model);
    }
    match serving.reload_production().await {
        Ok(model) => Some(model),
        Err(e) => {
            warn!(error = %e, "Serving without a model");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::pipeline::{TrainingParams, build_pipelines};
    use crate::training::Trainer;
    use pretty_assertions::assert_eq;
    use sentiment_core::LocalTracking;
    use sentiment_core::tracking::model_source;

    fn dataset() -> Dataset {
        let mut ds = Dataset::default();
        for i in 0..8 {
            ds.texts.push(format!("great phone love battery {}", ["fast", "cheap"][i % 2]));
            ds.labels.push("positive".into());
            ds.texts.push(format!("awful screen broken refund {}", ["slow", "costly"][i % 2]));
            ds.labels.push("negative".into());
        }
        ds
    }

    fn nb_only() -> TrainingParams {
        TrainingParams {
            families: vec![ModelFamily::NaiveBayes],
            ..TrainingParams::default()
        }
    }

    #[tokio::test]
    async fn test_load_production_and_predict() {
        let tracker: Arc<dyn TrackingBackend> = Arc::new(LocalTracking::in_memory());
        let runs = Trainer::new(Arc::clone(&tracker), "s", "MobileSentimentModel")
            .train_candidates(&dataset(), &nb_only())
            .await
            .unwrap();
        let version = runs[0].model_version.clone().unwrap();
        tracker
            .set_model_version_alias("MobileSentimentModel", "Production", &version.version)
            .await
            .unwrap();

        let serving = ServingState::new(ProductionLoader::new(
            Arc::clone(&tracker),
            "MobileSentimentModel",
            "Production",
        ));
        assert!(serving.current().is_none());
        let model = serving.reload_production().await.unwrap();
        assert_eq!(model.family, ModelFamily::NaiveBayes);
        assert!(model.metrics.contains_key("macro_f1"));
        let labels = model
            .predict_labels(&["love this great phone", "broken awful screen"])
            .unwrap();
        assert_eq!(labels, vec!["positive".to_string(), "negative".to_string()]);

        let p = model.predict_one("great battery").unwrap();
        assert_eq!(p.label, "positive");
        assert!(p.confidence > 0.5);
        assert_eq!(p.probabilities.len(), 2);
        assert!(serving.current().is_some());
        serving.clear();
        assert!(serving.current().is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_other_registered_model_and_run_name() {
        let tracker: Arc<dyn TrackingBackend> = Arc::new(LocalTracking::in_memory());
        let exp = tracker.get_or_create_experiment("s").await.unwrap();
        let run = tracker.start_run(&exp, "LogisticRegression").await.unwrap();
        let mut pipeline = build_pipelines(&TrainingParams::default()).remove(0);
        let ds = dataset();
        pipeline.fit(&ds.texts, &[0, 1].repeat(8), 2).unwrap();
        tracker
            .log_artifact(&run.run_id, &model_artifact_path("lr"), &pipeline.to_json().unwrap())
            .await
            .unwrap();
        let v = tracker
            .create_model_version("LegacyModel", &run.run_id, &model_source(&run.artifact_uri, "lr_model"))
            .await
            .unwrap();
        tracker
            .set_model_version_alias("LegacyModel", "Production", &v.version)
            .await
            .unwrap();

        let loader = ProductionLoader::new(Arc::clone(&tracker), "MobileSentimentModel", "Production");
        let model = loader.load().await.unwrap();
        assert_eq!(model.family, ModelFamily::LogisticRegression);
        assert_eq!(model.version.name, "LegacyModel");
        // No encoder artifact: ids come back as strings.
        let labels = model.predict_labels(&["great phone"]).unwrap();
        assert!(labels[0] == "0" || labels[0] == "1");
    }

    #[tokio::test]
    async fn test_missing_alias_errors() {
        let tracker: Arc<dyn TrackingBackend> = Arc::new(LocalTracking::in_memory());
        let loader = ProductionLoader::new(tracker, "MobileSentimentModel", "Production");
        assert!(loader.load().await.is_err());
    }
}
