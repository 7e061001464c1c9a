//! Google Cloud Storage client over the JSON API.
//!
//! Works against real GCS given a bearer token, and against the
//! `fake-gcs-server` emulator used in local deployments (no auth).

use super::{BlobMeta, ObjectStore};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
}

impl From<WireObject> for BlobMeta {
    fn from(o: WireObject) -> Self {
        BlobMeta {
            size: o.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            content_type: o.content_type.unwrap_or_default(),
            created_at: o.time_created.unwrap_or_else(Utc::now),
            name: o.name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<WireObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct GcsObjectStore {
    endpoint: String,
    bucket: String,
    token: Option<String>,
    client: Client,
}

impl GcsObjectStore {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token: None,
            client,
        })
    }

    /// Attach an OAuth bearer token to every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            self.bucket,
            urlencoding::encode(name)
        )
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self, project: &str) -> Result<()> {
        let url = format!("{}/storage/v1/b/{}", self.endpoint, self.bucket);
        let resp = self.authed(self.client.get(&url)).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != StatusCode::NOT_FOUND {
            return Err(CoreError::storage(format!(
                "bucket lookup {} returned {}",
                self.bucket,
                resp.status()
            )));
        }

        let url = format!("{}/storage/v1/b", self.endpoint);
        let resp = self
            .authed(self.client.post(&url))
            .query(&[("project", project)])
            .json(&json!({ "name": self.bucket }))
            .send()
            .await?;
        // 409: created concurrently by another replica.
        if resp.status().is_success() || resp.status() == StatusCode::CONFLICT {
            info!(bucket = %self.bucket, "Created storage bucket");
            return Ok(());
        }
        Err(CoreError::storage(format!(
            "bucket create {} returned {}",
            self.bucket,
            resp.status()
        )))
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn upload(&self, path: &str, contents: Vec<u8>, content_type: &str) -> Result<BlobMeta> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint, self.bucket
        );
        let resp = self
            .authed(self.client.post(&url))
            .query(&[("uploadType", "media"), ("name", path)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(contents)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CoreError::storage(format!(
                "upload {path} returned {}",
                resp.status()
            )));
        }
        let object: WireObject = resp.json().await?;
        Ok(object.into())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, self.bucket);
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self.authed(self.client.get(&url)).query(&[("prefix", prefix)]);
            if let Some(t) = &token {
                req = req.query(&[("pageToken", t.as_str())]);
            }
            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(CoreError::storage(format!(
                    "list {prefix} returned {}",
                    resp.status()
                )));
            }
            let page: ListPage = resp.json().await?;
            out.extend(page.items.into_iter().map(BlobMeta::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self
            .authed(self.client.get(self.object_url(path)))
            .query(&[("alt", "media")])
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(CoreError::not_found(format!("object {path}"))),
            s => Err(CoreError::storage(format!("download {path} returned {s}"))),
        }
    }
}
