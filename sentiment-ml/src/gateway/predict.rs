use super::AppState;
use crate::data::{REVIEW_COLUMN, TARGET_COLUMN, Table};
use crate::error::{MlError, Result};
use crate::training::RetrainTrigger;
use axum::Json;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::State;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sentiment_core::storage::CONTENT_TYPE_CSV;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Prediction cell when no model is loaded.
pub const MODEL_NOT_FOUND: &str = "model_not_found";
/// Prediction cell when the loaded model failed on the batch.
pub const MODEL_ERROR: &str = "model_error";

const X_DRIFT_DETECTED: HeaderName = HeaderName::from_static("x-drift-detected");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// `YYYYmmdd_HHMMSS_` plus eight hex chars.
pub fn new_request_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() }))).into_response()
}

/// The uploaded file: the field named `file`, else the first field carrying
/// a file name, else the first field.
async fn read_upload(mut multipart: Multipart) -> std::result::Result<Vec<u8>, String> {
    let mut fallback = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        let named_file = field.name() == Some("file");
        let has_filename = field.file_name().is_some();
        let bytes = field.bytes().await.map_err(|e| e.to_string())?;
        if named_file {
            return Ok(bytes.to_vec());
        }
        if has_filename && fallback.is_none() {
            fallback = Some(bytes.to_vec());
        }
    }
    fallback.ok_or_else(|| "no file in upload".to_string())
}

fn review_texts(bytes: &[u8]) -> Result<Vec<String>> {
    let mut table = Table::parse_bytes(bytes)?;
    table.rename_column("text", REVIEW_COLUMN);
    table
        .column(REVIEW_COLUMN)
        .ok_or_else(|| MlError::invalid_input(format!("missing column {REVIEW_COLUMN}")))
}

async fn predict_labels(state: &AppState, texts: &[String]) -> Vec<String> {
    let Some(model) = state.serving.current() else {
        warn!(rows = texts.len(), "No model loaded, returning sentinel predictions");
        return vec![MODEL_NOT_FOUND.to_string(); texts.len()];
    };
    let batch = texts.to_vec();
    let outcome = tokio::task::spawn_blocking(move || model.predict_labels(&batch)).await;
    match outcome {
        Ok(Ok(labels)) => labels,
        Ok(Err(e)) => {
            warn!(error = %e, "Batch prediction failed");
            vec![MODEL_ERROR.to_string(); texts.len()]
        }
        Err(e) => {
            warn!(error = %e, "Prediction task panicked");
            vec![MODEL_ERROR.to_string(); texts.len()]
        }
    }
}

/// Compare the batch with the latest labeled snapshot and schedule a retrain
/// when it drifted. Any missing input or failure means "no drift".
async fn check_drift(state: &AppState, texts: &[String], request_id: &str) -> bool {
    let Some(detector) = &state.drift else {
        return false;
    };
    let prefix = &state.settings.labeled_prefix;
    let reference = match state.store.download_latest(prefix).await {
        Ok(Some((meta, bytes))) => match review_texts(&bytes) {
            Ok(t) => {
                let t: Vec<String> = t.into_iter().filter(|s| !s.trim().is_empty()).collect();
                if t.is_empty() {
                    info!(request_id, object = %meta.name, "Reference dataset is empty, drift check skipped");
                    return false;
                }
                t
            }
            Err(e) => {
                warn!(request_id, object = %meta.name, error = %e, "Reference dataset unreadable, drift check skipped");
                return false;
            }
        },
        Ok(None) => {
            info!(request_id, prefix = %prefix, "No reference dataset, drift check skipped");
            return false;
        }
        Err(e) => {
            warn!(request_id, error = %e, "Reference lookup failed, drift check skipped");
            return false;
        }
    };
    let current: Vec<String> = texts.iter().filter(|s| !s.trim().is_empty()).cloned().collect();

    match detector.assess(&reference, &current, request_id).await {
        Ok(assessment) => {
            info!(
                request_id,
                drift_share = assessment.drift_share,
                drift_detected = assessment.drift_detected,
                "Drift assessed"
            );
            if assessment.drift_detected {
                let ack = state.orchestrator.trigger(RetrainTrigger::Drift {
                    drift_share: assessment.drift_share,
                    request_id: request_id.to_string(),
                });
                info!(request_id, ack = ?ack, "Drift-triggered retrain requested");
            }
            assessment.drift_detected
        }
        Err(e) => {
            warn!(request_id, error = %e, "Drift assessment failed");
            false
        }
    }
}

/// `POST /predict`: multipart CSV in, CSV with a `sentiment` column out.
pub(super) async fn predict_csv(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let multipart = match multipart {
        Ok(m) => m,
        Err(e) => return bad_request(format!("invalid upload: {e}")),
    };
    let bytes = match read_upload(multipart).await {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid upload: {e}")),
    };
    let texts = match review_texts(&bytes) {
        Ok(t) => t,
        Err(e) => return bad_request(e.to_string()),
    };

    let request_id = new_request_id();
    info!(request_id = %request_id, rows = texts.len(), "Batch prediction request");
    let labels = predict_labels(&state, &texts).await;

    let mut out = Table::new(vec![REVIEW_COLUMN.to_string(), TARGET_COLUMN.to_string()]);
    out.rows = texts
        .iter()
        .zip(&labels)
        .map(|(t, l)| vec![t.clone(), l.clone()])
        .collect();
    let csv = out.to_csv();

    let archive = format!("{}predicted_{request_id}.csv", state.settings.prediction_prefix);
    if let Err(e) = state
        .store
        .upload(&archive, csv.clone().into_bytes(), CONTENT_TYPE_CSV)
        .await
    {
        warn!(request_id = %request_id, object = %archive, error = %e, "Prediction archive upload failed");
    }

    let drift_detected = check_drift(&state, &texts, &request_id).await;
    if state.settings.force_retrain_on_predict && !drift_detected {
        let ack = state.orchestrator.trigger(RetrainTrigger::Manual);
        info!(request_id = %request_id, ack = ?ack, "Forced retrain after prediction");
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"predicted_{request_id}.csv\""),
            ),
            (X_DRIFT_DETECTED, drift_detected.to_string()),
            (X_REQUEST_ID, request_id),
        ],
        csv,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct PredictJsonRequest {
    text: String,
}

#[derive(Debug, Serialize)]
pub(super) struct PredictJsonResponse {
    text: String,
    prediction: String,
    confidence: f64,
    probabilities: BTreeMap<String, f64>,
}

/// `POST /predict_json`: `{text}` in, label with probabilities out.
pub(super) async fn predict_json(
    State(state): State<AppState>,
    Json(req): Json<PredictJsonRequest>,
) -> Json<PredictJsonResponse> {
    let Some(model) = state.serving.current() else {
        return Json(PredictJsonResponse {
            text: req.text,
            prediction: MODEL_NOT_FOUND.to_string(),
            confidence: 0.0,
            probabilities: BTreeMap::new(),
        });
    };
    let text = req.text.clone();
    let outcome = tokio::task::spawn_blocking(move || model.predict_one(&text)).await;
    let p = match outcome {
        Ok(Ok(p)) => p,
        Ok(Err(e)) => {
            warn!(error = %e, "Single prediction failed");
            return Json(model_error_response(req.text));
        }
        Err(e) => {
            warn!(error = %e, "Prediction task panicked");
            return Json(model_error_response(req.text));
        }
    };
    Json(PredictJsonResponse {
        text: req.text,
        prediction: p.label,
        confidence: p.confidence,
        probabilities: p.probabilities,
    })
}

fn model_error_response(text: String) -> PredictJsonResponse {
    PredictJsonResponse {
        text,
        prediction: MODEL_ERROR.to_string(),
        confidence: 0.0,
        probabilities: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_review_texts_accepts_text_alias() {
        let texts = review_texts(b"text,brand\nnice phone,Acme\n").unwrap();
        assert_eq!(texts, vec!["nice phone".to_string()]);
        assert!(review_texts(b"comment\nhello\n").is_err());
    }
}
