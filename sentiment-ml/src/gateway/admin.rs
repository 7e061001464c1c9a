use super::AppState;
use crate::training::RetrainTrigger;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{info, warn};

/// `POST /retrain`: schedule a manual retrain and acknowledge immediately.
pub(super) async fn retrain(State(state): State<AppState>) -> Response {
    let ack = state.orchestrator.trigger(RetrainTrigger::Manual);
    info!(ack = ?ack, "Manual retrain requested");
    (StatusCode::ACCEPTED, Json(ack)).into_response()
}

pub(super) async fn retrain_status(State(state): State<AppState>) -> Response {
    let orch = &state.orchestrator;
    Json(json!({
        "state": orch.state(),
        "running": orch.is_running(),
        "last_report": orch.last_report(),
        "recent_jobs": orch.recent_jobs(10),
    }))
    .into_response()
}

/// `GET /loadmodel`: re-resolve the production alias and swap it in.
pub(super) async fn load_model(State(state): State<AppState>) -> Response {
    match state.serving.reload_production().await {
        Ok(model) => Json(json!({
            "status": "loaded",
            "model": model.family.display_name(),
            "registered_model_name": model.version.name,
            "version": model.version.version,
            "run_id": model.version.run_id,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Model reload failed");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub(super) async fn model_metrics(State(state): State<AppState>) -> Response {
    match state.serving.current() {
        Some(model) => Json(json!({
            "model": model.family.display_name(),
            "version": model.version.version,
            "run_id": model.version.run_id,
            "metrics": model.metrics,
        }))
        .into_response(),
        None => Json(json!({ "error": "No model loaded" })).into_response(),
    }
}

pub(super) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": 200 }))
}
