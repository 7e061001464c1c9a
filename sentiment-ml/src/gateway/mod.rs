//! HTTP gateway built on axum.
//!
//! Routes:
//! - `POST /predict` batch CSV prediction with drift check
//! - `POST /predict_json` single text prediction
//! - `POST /retrain`, `GET /retrain/status`
//! - `GET /loadmodel`, `GET /model/metrics`, `GET /healthcheck`
//! - `/reports/*` static drift reports

mod admin;
mod predict;

use crate::drift::DriftDetector;
use crate::serving::ServingState;
use crate::training::RetrainOrchestrator;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use sentiment_core::ObjectStore;
use sentiment_core::config::ServiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use predict::{MODEL_ERROR, MODEL_NOT_FOUND, new_request_id};

/// Request-path knobs taken from the service configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub labeled_prefix: String,
    pub prediction_prefix: String,
    pub force_retrain_on_predict: bool,
    pub reports_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl GatewaySettings {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            labeled_prefix: cfg.storage.labeled_prefix.clone(),
            prediction_prefix: cfg.storage.prediction_prefix.clone(),
            force_retrain_on_predict: cfg.retrain.force_on_predict,
            reports_dir: cfg.server.reports_dir.clone(),
            max_upload_bytes: cfg.server.max_upload_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Shared handler state. Everything is behind `Arc`; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub serving: Arc<ServingState>,
    pub orchestrator: Arc<RetrainOrchestrator>,
    pub store: Arc<dyn ObjectStore>,
    /// `None` disables the drift check.
    pub drift: Option<Arc<dyn DriftDetector>>,
    pub settings: Arc<GatewaySettings>,
}

/// Build the full router with CORS, tracing and the static reports mount.
pub fn router(state: AppState) -> Router {
    let reports = ServeDir::new(&state.settings.reports_dir);
    let body_limit = state.settings.max_upload_bytes;
    Router::new()
        .route("/predict", post(predict::predict_csv))
        .route("/predict_json", post(predict::predict_json))
        .route("/retrain", post(admin::retrain))
        .route("/retrain/status", get(admin::retrain_status))
        .route("/loadmodel", get(admin::load_model))
        .route("/model/metrics", get(admin::model_metrics))
        .route("/healthcheck", get(admin::healthcheck))
        .nest_service("/reports", reports)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(&state.settings.reports_dir).await?;
    let app = router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
}
