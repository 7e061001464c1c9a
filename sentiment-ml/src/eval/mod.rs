//! Candidate evaluation: fit, score on the validation split, log metrics and
//! diagnostic artifacts to the tracking run.
//!
//! Diagnostics (decision boundary, data drift report, artifact uploads) run
//! after the metrics are logged, on their own blocking task. They are best
//! effort: failures and panics are logged and never fail the evaluation.

pub mod boundary;
pub mod data_report;
pub mod metrics;

pub use data_report::{DataDriftReport, data_drift_report};
pub use metrics::{METRIC_NAMES, classification_metrics, classification_report};

use crate::data::Split;
use crate::error::Result;
use crate::pipeline::SentimentPipeline;
use sentiment_core::TrackingBackend;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DATA_DRIFT_REPORT_HTML: &str = "reports/data_drift_report.html";
pub const DATA_DRIFT_REPORT_JSON: &str = "reports/data_drift_report.json";

/// A fitted candidate and its validation scores.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub pipeline: SentimentPipeline,
    pub metrics: BTreeMap<String, f64>,
}

struct Scored {
    pipeline: SentimentPipeline,
    metrics: BTreeMap<String, f64>,
    confusion: Value,
    report: Value,
    train_pred: Vec<usize>,
    valid_pred: Vec<usize>,
}

struct Diagnostics {
    boundary: Result<Value>,
    drift: DataDriftReport,
}

fn fit_and_score(mut pipeline: SentimentPipeline, split: &Split) -> Result<Scored> {
    let n_classes = split.n_classes();
    pipeline.fit(&split.train_texts, &split.train_labels, n_classes)?;
    let valid_pred = pipeline.predict_batch(&split.valid_texts)?;
    let train_pred = pipeline.predict_batch(&split.train_texts)?;
    let metrics = classification_metrics(&split.valid_labels, &valid_pred, n_classes);

    let names = split.encoder.classes().to_vec();
    let confusion = metrics::confusion_matrix_figure(
        &split.valid_labels,
        &valid_pred,
        &names,
        "Confusion Matrix",
    );
    let report = classification_report(&split.valid_labels, &valid_pred, &names);

    Ok(Scored {
        pipeline,
        metrics,
        confusion,
        report,
        train_pred,
        valid_pred,
    })
}

fn diagnose(
    pipeline: &SentimentPipeline,
    split: &Split,
    train_pred: &[usize],
    valid_pred: &[usize],
    model_name: &str,
) -> Diagnostics {
    let names = split.encoder.classes().to_vec();
    let all_x: Vec<Vec<f64>> = pipeline
        .transform(&split.train_texts)
        .into_iter()
        .chain(pipeline.transform(&split.valid_texts))
        .collect();
    let all_y: Vec<usize> = split
        .train_labels
        .iter()
        .chain(&split.valid_labels)
        .copied()
        .collect();
    let boundary = boundary::decision_boundary_figure(
        pipeline.classifier(),
        &all_x,
        &all_y,
        &names,
        &format!("{model_name} Decision Boundary (2D SVD)"),
    );

    let drift = data_drift_report(
        (split.train_texts.as_slice(), &split.train_labels, train_pred),
        (split.valid_texts.as_slice(), &split.valid_labels, valid_pred),
    );
    Diagnostics { boundary, drift }
}

/// Runs `job` on the blocking pool; a panic is logged and yields `None`.
async fn run_diagnostics<F>(job: F, run_id: &str) -> Option<Diagnostics>
where
    F: FnOnce() -> Diagnostics + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(run_id, error = %e, "Diagnostics task failed, skipping diagnostic artifacts");
            None
        }
    }
}

async fn log_json(tracker: &dyn TrackingBackend, run_id: &str, path: &str, value: &Value) {
    if let Err(e) = tracker.log_dict(run_id, path, value).await {
        warn!(run_id, path, error = %e, "Failed to log artifact");
    }
}

async fn log_diagnostics(
    tracker: &dyn TrackingBackend,
    run_id: &str,
    model_name: &str,
    diagnostics: &Diagnostics,
) {
    match &diagnostics.boundary {
        Ok(figure) => {
            log_json(
                tracker,
                run_id,
                &format!("{model_name}__decision_boundary.json"),
                figure,
            )
            .await
        }
        Err(e) => warn!(run_id, model = model_name, error = %e, "Decision boundary figure failed"),
    }
    match serde_json::to_value(&diagnostics.drift) {
        Ok(json) => log_json(tracker, run_id, DATA_DRIFT_REPORT_JSON, &json).await,
        Err(e) => warn!(run_id, error = %e, "Data drift report serialization failed"),
    }
    if let Err(e) = tracker
        .log_artifact(
            run_id,
            DATA_DRIFT_REPORT_HTML,
            diagnostics.drift.to_html().as_bytes(),
        )
        .await
    {
        warn!(run_id, error = %e, "Failed to log data drift report");
    }
}

/// Fit `pipeline` on the training split, score it on the validation split,
/// and log everything under `run_id`.
pub async fn evaluate_model(
    pipeline: SentimentPipeline,
    split: Arc<Split>,
    model_name: &str,
    tracker: &dyn TrackingBackend,
    run_id: &str,
) -> Result<Evaluation> {
    let fit_split = Arc::clone(&split);
    let Scored {
        pipeline,
        metrics,
        confusion,
        report,
        train_pred,
        valid_pred,
    } = tokio::task::spawn_blocking(move || fit_and_score(pipeline, &fit_split)).await??;

    for (key, value) in &metrics {
        tracker.log_metric(run_id, key, *value).await?;
    }
    debug!(run_id, model = model_name, ?metrics, "Logged validation metrics");

    log_json(
        tracker,
        run_id,
        &format!("{model_name}__confusion_matrix.json"),
        &confusion,
    )
    .await;
    log_json(
        tracker,
        run_id,
        &format!("{model_name}__classification_report.json"),
        &report,
    )
    .await;

    let fitted = pipeline.clone();
    let name = model_name.to_string();
    let diagnostics = run_diagnostics(
        move || diagnose(&fitted, &split, &train_pred, &valid_pred, &name),
        run_id,
    )
    .await;
    if let Some(diagnostics) = diagnostics {
        log_diagnostics(tracker, run_id, model_name, &diagnostics).await;
    }

    Ok(Evaluation { pipeline, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, stratified_split};
    use crate::pipeline::{TrainingParams, build_pipelines};
    use crate::models::ModelFamily;
    use sentiment_core::LocalTracking;

    fn dataset() -> Dataset {
        let mut ds = Dataset::default();
        for i in 0..12 {
            ds.texts.push(format!("great phone love battery model{}", i % 3));
            ds.labels.push("positive".into());
            ds.texts.push(format!("awful screen broken support model{}", i % 3));
            ds.labels.push("negative".into());
        }
        ds
    }

    #[tokio::test]
    async fn test_evaluate_logs_metrics_and_artifacts() {
        let tracker = LocalTracking::in_memory();
        let exp = tracker.get_or_create_experiment("eval").await.unwrap();
        let run = tracker.start_run(&exp, "LogisticRegression").await.unwrap();
        let split = Arc::new(stratified_split(&dataset(), 0.5, 42).unwrap());
        let pipe = build_pipelines(&TrainingParams::default()).remove(0);

        let eval = evaluate_model(pipe, split, "LogisticRegression", &tracker, &run.run_id)
            .await
            .unwrap();
        assert!(eval.pipeline.is_fitted());
        assert_eq!(eval.metrics["accuracy"], 1.0);

        let logged = tracker.get_run(&run.run_id).await.unwrap();
        for name in METRIC_NAMES {
            assert!(logged.metric(name).is_some(), "missing {name}");
        }
        for path in [
            "LogisticRegression__confusion_matrix.json",
            "LogisticRegression__decision_boundary.json",
            "LogisticRegression__classification_report.json",
            DATA_DRIFT_REPORT_JSON,
            DATA_DRIFT_REPORT_HTML,
        ] {
            assert!(tracker.download_artifact(&run.run_id, path).await.is_ok(), "{path}");
        }
    }

    #[tokio::test]
    async fn test_boundary_failure_does_not_fail_evaluation() {
        let tracker = LocalTracking::in_memory();
        let exp = tracker.get_or_create_experiment("eval").await.unwrap();
        let run = tracker.start_run(&exp, "NaiveBayes").await.unwrap();
        let split = Arc::new(stratified_split(&dataset(), 0.5, 42).unwrap());
        let params = TrainingParams {
            families: vec![ModelFamily::NaiveBayes],
            ..TrainingParams::default()
        };
        let pipe = build_pipelines(&params).remove(0);

        let eval = evaluate_model(pipe, split, "NaiveBayes", &tracker, &run.run_id)
            .await
            .unwrap();
        assert!(eval.metrics["macro_f1"] > 0.5);
        assert!(
            tracker
                .download_artifact(&run.run_id, "NaiveBayes__decision_boundary.json")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_diagnostics_panic_is_contained() {
        let skipped = run_diagnostics(|| panic!("degenerate projection"), "run-1").await;
        assert!(skipped.is_none());

        let ok = run_diagnostics(
            || {
                let texts: Vec<String> = vec!["great phone".into(), "awful screen".into()];
                Diagnostics {
                    boundary: Err(crate::error::MlError::model("too few points")),
                    drift: data_drift_report(
                        (texts.as_slice(), &[1, 0], &[1, 0]),
                        (texts.as_slice(), &[1, 0], &[1, 0]),
                    ),
                }
            },
            "run-1",
        )
        .await
        .unwrap();
        assert!(ok.boundary.is_err());
        assert_eq!(ok.drift.number_of_drifted_columns, 0);
    }
}
