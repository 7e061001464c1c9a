//! Object storage for labeled snapshots, archived predictions and reports.
//!
//! Objects are write-once; the "latest" object under a prefix is the one with
//! the greatest creation time.

pub mod gcs;
pub mod local;

pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE_CSV: &str = "text/csv";
pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Minimal object-store contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short store name for logs.
    fn name(&self) -> &str;

    /// Write an object, replacing any previous object of the same name.
    async fn upload(&self, path: &str, contents: Vec<u8>, content_type: &str) -> Result<BlobMeta>;

    /// Objects whose name starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    /// Read an object.
    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// The most recently created object under `prefix`, if any.
    async fn download_latest(&self, prefix: &str) -> Result<Option<(BlobMeta, Vec<u8>)>> {
        let Some(latest) = latest(self.list(prefix).await?) else {
            return Ok(None);
        };
        let bytes = self.download(&latest.name).await?;
        Ok(Some((latest, bytes)))
    }
}

/// Greatest creation time wins; ties break on name so the choice is stable.
pub fn latest(blobs: Vec<BlobMeta>) -> Option<BlobMeta> {
    blobs
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn blob(name: &str, secs: i64) -> BlobMeta {
        BlobMeta {
            name: name.into(),
            size: 1,
            content_type: CONTENT_TYPE_CSV.into(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_latest_by_creation_time() {
        let picked = latest(vec![blob("b", 10), blob("a", 20), blob("c", 5)]).unwrap();
        assert_eq!(picked.name, "a");
    }

    #[test]
    fn test_latest_tie_breaks_on_name() {
        let picked = latest(vec![blob("labeled_1", 10), blob("labeled_2", 10)]).unwrap();
        assert_eq!(picked.name, "labeled_2");
        assert!(latest(Vec::new()).is_none());
    }
}
