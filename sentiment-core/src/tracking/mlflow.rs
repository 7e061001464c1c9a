//! MLflow tracking server client over the REST API (`/api/2.0/mlflow/...`).
//!
//! Artifacts go through the tracking server's artifact proxy
//! (`/api/2.0/mlflow-artifacts/artifacts/...`), so the service never needs
//! direct credentials to the artifact store.

use super::{ModelVersion, Run, RunData, RunInfo, RunStatus, TrackingBackend, RUN_NAME_TAG};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const ARTIFACT_PROXY_SCHEME: &str = "mlflow-artifacts:/";

// --- Wire types -------------------------------------------------------------

/// int64 fields come back as numbers or as strings depending on server version.
fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Int(i64),
        Str(String),
    }
    match Option::<Wire>::deserialize(d)? {
        None => Ok(None),
        Some(Wire::Int(v)) => Ok(Some(v)),
        Some(Wire::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    start_time: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    end_time: Option<i64>,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct KeyValue<V> {
    key: String,
    value: V,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<KeyValue<f64>>,
    #[serde(default)]
    params: Vec<KeyValue<String>>,
    #[serde(default)]
    tags: Vec<KeyValue<String>>,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    version: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    creation_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

/// Whether an error response means "does not exist". MLflow answers an
/// unset alias on an existing registered model with 400
/// `INVALID_PARAMETER_VALUE` ("Registered model alias X not found."), not 404.
fn is_missing(status: StatusCode, err: &ErrorBody) -> bool {
    status == StatusCode::NOT_FOUND
        || err.error_code == "RESOURCE_DOES_NOT_EXIST"
        || (err.error_code == "INVALID_PARAMETER_VALUE"
            && err.message.to_ascii_lowercase().contains("not found"))
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_status(status: Option<&str>) -> RunStatus {
    match status {
        Some("FINISHED") => RunStatus::Finished,
        Some("FAILED") => RunStatus::Failed,
        Some("KILLED") => RunStatus::Killed,
        _ => RunStatus::Running,
    }
}

impl From<WireRunInfo> for RunInfo {
    fn from(w: WireRunInfo) -> Self {
        RunInfo {
            run_id: w.run_id,
            experiment_id: w.experiment_id,
            run_name: w.run_name.unwrap_or_default(),
            status: parse_status(w.status.as_deref()),
            start_time: w.start_time.map(millis_to_utc).unwrap_or_else(Utc::now),
            end_time: w.end_time.map(millis_to_utc),
            artifact_uri: w.artifact_uri,
        }
    }
}

impl From<WireRun> for Run {
    fn from(w: WireRun) -> Self {
        let data = RunData {
            metrics: w.data.metrics.into_iter().map(|m| (m.key, m.value)).collect(),
            params: w.data.params.into_iter().map(|p| (p.key, p.value)).collect(),
            tags: w.data.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        };
        let mut info = RunInfo::from(w.info);
        if info.run_name.is_empty() {
            if let Some(name) = data.tags.get(RUN_NAME_TAG) {
                info.run_name = name.clone();
            }
        }
        Run { info, data }
    }
}

impl From<WireModelVersion> for ModelVersion {
    fn from(w: WireModelVersion) -> Self {
        ModelVersion {
            name: w.name,
            version: w.version,
            run_id: w.run_id,
            source: w.source,
            aliases: w.aliases,
            creation_time: w.creation_timestamp.map(millis_to_utc),
        }
    }
}

// --- Client -----------------------------------------------------------------

/// Tracking backend talking to an MLflow tracking server.
pub struct MlflowTracking {
    base_url: String,
    client: Client,
    /// run_id -> artifact root, filled lazily.
    artifact_roots: Mutex<HashMap<String, String>>,
}

impl MlflowTracking {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            artifact_roots: Mutex::new(HashMap::new()),
        })
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let mut req = self.client.request(method, self.api(endpoint)).query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await?;
            // Empty bodies come back for write calls.
            if bytes.is_empty() {
                return Ok(serde_json::from_str("{}")?);
            }
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let text = resp.text().await.unwrap_or_default();
        let err: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            error_code: String::new(),
            message: text,
        });
        if is_missing(status, &err) {
            return Err(CoreError::not_found(format!("{endpoint}: {}", err.message)));
        }
        Err(CoreError::tracking(format!(
            "{endpoint} returned {status}: {} {}",
            err.error_code, err.message
        )))
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: serde_json::Value) -> Result<T> {
        self.call(Method::POST, endpoint, &[], Some(body)).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        self.call(Method::GET, endpoint, query, None).await
    }

    async fn artifact_url(&self, run_id: &str, path: &str) -> Result<String> {
        let cached = self
            .artifact_roots
            .lock()
            .ok()
            .and_then(|roots| roots.get(run_id).cloned());
        let root = match cached {
            Some(root) => root,
            None => {
                let run = self.get_run(run_id).await?;
                let root = run.info.artifact_uri;
                if let Ok(mut roots) = self.artifact_roots.lock() {
                    roots.insert(run_id.to_string(), root.clone());
                }
                root
            }
        };
        let relative = root.strip_prefix(ARTIFACT_PROXY_SCHEME).ok_or_else(|| {
            CoreError::tracking(format!(
                "artifact root {root} is not served by the tracking server's artifact proxy"
            ))
        })?;
        Ok(format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
            self.base_url,
            relative.trim_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Serialize)]
struct LogMetric<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[async_trait]
impl TrackingBackend for MlflowTracking {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Exp {
            experiment_id: String,
        }
        #[derive(Deserialize)]
        struct GetResp {
            experiment: Exp,
        }

        match self
            .get::<GetResp>("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(resp) => Ok(resp.experiment.experiment_id),
            Err(e) if e.is_not_found() => {
                debug!(experiment = name, "Creating MLflow experiment");
                let created: Exp = self.post("experiments/create", json!({ "name": name })).await?;
                Ok(created.experiment_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        #[derive(Deserialize)]
        struct Created {
            run: WireRun,
        }
        let created: Created = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_millis(),
                    "tags": [{ "key": RUN_NAME_TAG, "value": run_name }],
                }),
            )
            .await?;
        let run = Run::from(created.run);
        if let Ok(mut roots) = self.artifact_roots.lock() {
            roots.insert(run.info.run_id.clone(), run.info.artifact_uri.clone());
        }
        Ok(run.info)
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: Empty = self
            .post(
                "runs/update",
                json!({ "run_id": run_id, "status": status.as_str(), "end_time": now_millis() }),
            )
            .await?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let body = serde_json::to_value(LogMetric {
            run_id,
            key,
            value,
            timestamp: now_millis(),
            step: 0,
        })?;
        let _: Empty = self.post("runs/log-metric", body).await?;
        Ok(())
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: Empty = self
            .post(
                "runs/log-parameter",
                json!({ "run_id": run_id, "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: Empty = self
            .post(
                "runs/set-tag",
                json!({ "run_id": run_id, "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let url = self.artifact_url(run_id, path).await?;
        let resp = self.client.put(&url).body(contents.to_vec()).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::tracking(format!(
                "artifact upload {path} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.artifact_url(run_id, path).await?;
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(CoreError::not_found(format!(
                "artifact {path} of run {run_id}"
            ))),
            s => Err(CoreError::tracking(format!(
                "artifact download {path} returned {s}"
            ))),
        }
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>> {
        #[derive(Deserialize)]
        struct Page {
            #[serde(default)]
            runs: Vec<WireRun>,
            #[serde(default)]
            next_page_token: Option<String>,
        }

        let mut runs = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut body = json!({
                "experiment_ids": [experiment_id],
                "max_results": 1000,
                "order_by": ["attributes.start_time DESC"],
            });
            if let Some(t) = &token {
                body["page_token"] = json!(t);
            }
            let page: Page = self.post("runs/search", body).await?;
            runs.extend(page.runs.into_iter().map(Run::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(runs)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        #[derive(Deserialize)]
        struct Resp {
            run: WireRun,
        }
        let resp: Resp = self.get("runs/get", &[("run_id", run_id)]).await?;
        Ok(resp.run.into())
    }

    async fn create_model_version(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion> {
        #[derive(Deserialize)]
        struct Resp {
            model_version: WireModelVersion,
        }

        let created: Result<Empty> = self
            .post("registered-models/create", json!({ "name": name }))
            .await;
        if let Err(e) = created {
            // Already registered is the common case after the first run.
            if !e.to_string().contains("RESOURCE_ALREADY_EXISTS") {
                warn!(model = name, error = %e, "Registering model failed, trying version create anyway");
            }
        }

        let resp: Resp = self
            .post(
                "model-versions/create",
                json!({ "name": name, "source": source, "run_id": run_id }),
            )
            .await?;
        Ok(resp.model_version.into())
    }

    async fn search_model_versions_by_run(&self, run_id: &str) -> Result<Vec<ModelVersion>> {
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            model_versions: Vec<WireModelVersion>,
        }
        let filter = format!("run_id='{run_id}'");
        let resp: Resp = self
            .get("model-versions/search", &[("filter", filter.as_str())])
            .await?;
        Ok(resp.model_versions.into_iter().map(Into::into).collect())
    }

    async fn search_registered_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Model {
            name: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            registered_models: Vec<Model>,
        }
        let resp: Resp = self
            .get("registered-models/search", &[("max_results", "1000")])
            .await?;
        Ok(resp.registered_models.into_iter().map(|m| m.name).collect())
    }

    async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<Option<ModelVersion>> {
        #[derive(Deserialize)]
        struct Resp {
            model_version: WireModelVersion,
        }
        match self
            .get::<Resp>("registered-models/alias", &[("name", name), ("alias", alias)])
            .await
        {
            Ok(resp) => Ok(Some(resp.model_version.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_model_version_alias(&self, name: &str, alias: &str, version: &str) -> Result<()> {
        let _: Empty = self
            .post(
                "registered-models/alias",
                json!({ "name": name, "alias": alias, "version": version }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_run_accepts_string_timestamps() {
        let raw = r#"{
            "info": {
                "run_id": "abc",
                "experiment_id": "1",
                "status": "FINISHED",
                "start_time": "1700000000000",
                "end_time": 1700000001000,
                "artifact_uri": "mlflow-artifacts:/1/abc/artifacts"
            },
            "data": {
                "metrics": [{"key": "macro_f1", "value": 0.8, "timestamp": 1, "step": 0}],
                "tags": [{"key": "mlflow.runName", "value": "lr_model"}]
            }
        }"#;
        let run: Run = serde_json::from_str::<WireRun>(raw).unwrap().into();
        assert_eq!(run.info.run_name, "lr_model");
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.metric("macro_f1"), Some(0.8));
        assert_eq!(run.info.start_time.timestamp_millis(), 1_700_000_000_000);
        assert!(run.info.end_time.is_some());
    }

    #[test]
    fn test_wire_model_version_conversion() {
        let raw = r#"{"name": "M", "version": "3", "run_id": "r", "source": "s", "aliases": ["Production"]}"#;
        let v: ModelVersion = serde_json::from_str::<WireModelVersion>(raw).unwrap().into();
        assert_eq!(v.version, "3");
        assert_eq!(v.aliases, vec!["Production".to_string()]);
        assert!(v.creation_time.is_none());
    }

    /// Answers every connection with one canned HTTP response.
    async fn canned_server(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_unset_alias_on_existing_model_is_none() {
        let url = canned_server(
            "400 Bad Request",
            r#"{"error_code": "INVALID_PARAMETER_VALUE", "message": "Registered model alias Production not found."}"#,
        )
        .await;
        let client = MlflowTracking::new(url).unwrap();
        let holder = client
            .get_model_version_by_alias("MobileSentimentModel", "Production")
            .await
            .unwrap();
        assert!(holder.is_none());
    }

    #[tokio::test]
    async fn test_unknown_registered_model_alias_is_none() {
        let url = canned_server(
            "404 Not Found",
            r#"{"error_code": "RESOURCE_DOES_NOT_EXIST", "message": "Registered Model with name=M not found"}"#,
        )
        .await;
        let client = MlflowTracking::new(url).unwrap();
        assert!(client.get_model_version_by_alias("M", "Production").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_bad_requests_stay_errors() {
        let url = canned_server(
            "400 Bad Request",
            r#"{"error_code": "INVALID_PARAMETER_VALUE", "message": "Alias name must not be empty"}"#,
        )
        .await;
        let client = MlflowTracking::new(url).unwrap();
        let err = client.get_model_version_by_alias("M", "").await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("INVALID_PARAMETER_VALUE"));
    }

    #[tokio::test]
    async fn test_first_promotion_over_mlflow_with_unset_alias() {
        use crate::promotion::{PromotionEngine, PromotionPolicy};
        use std::sync::Arc;

        let url = canned_server(
            "400 Bad Request",
            r#"{"error_code": "INVALID_PARAMETER_VALUE", "message": "Registered model alias Production not found."}"#,
        )
        .await;
        let tracker: Arc<dyn TrackingBackend> = Arc::new(MlflowTracking::new(url).unwrap());
        let engine = PromotionEngine::new(
            tracker,
            PromotionPolicy {
                alias: "Production".into(),
                staging_alias: "Staging".into(),
                primary_metric: "macro_f1".into(),
                min_improvement: 0.0,
            },
        );
        let current = engine
            .current_production("MobileSentimentModel", "Production")
            .await
            .unwrap();
        assert!(current.is_none());
    }

    #[test]
    fn test_api_url_trims_trailing_slash() {
        let client = MlflowTracking::new("http://mlflow:5000/").unwrap();
        assert_eq!(
            client.api("runs/get"),
            "http://mlflow:5000/api/2.0/mlflow/runs/get"
        );
    }
}
