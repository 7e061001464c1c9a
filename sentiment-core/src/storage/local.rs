//! Directory-backed object store.
//!
//! Object bytes live at `<root>/<name>`; metadata (content type and creation
//! time) is kept in `<root>/.index.json` so listing does not depend on
//! filesystem timestamp resolution.

use super::{BlobMeta, ObjectStore};
use crate::error::{CoreError, Result};
use crate::persistence::{SnapshotWriter, load_json, write_blocking};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

const INDEX_FILE: &str = ".index.json";

struct Index {
    entries: BTreeMap<String, BlobMeta>,
    revision: u64,
}

pub struct LocalObjectStore {
    root: PathBuf,
    index: Mutex<Index>,
    writer: SnapshotWriter,
}

impl LocalObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let entries = load_json(&root.join(INDEX_FILE))?.unwrap_or_default();
        Ok(Self {
            writer: SnapshotWriter::new(root.join(INDEX_FILE)),
            root,
            index: Mutex::new(Index {
                entries,
                revision: 0,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Object names are relative and may not climb out of the root.
    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        let valid = !name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(CoreError::invalid_input(format!("invalid object name '{name}'")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(&self, path: &str, contents: Vec<u8>, content_type: &str) -> Result<BlobMeta> {
        let file = self.object_path(path)?;
        let meta = BlobMeta {
            name: path.to_string(),
            size: contents.len() as u64,
            content_type: content_type.to_string(),
            created_at: Utc::now(),
        };
        write_blocking(file, contents).await?;

        let (revision, snapshot) = {
            let mut index = self
                .index
                .lock()
                .map_err(|_| CoreError::storage("object index lock poisoned"))?;
            index.entries.insert(path.to_string(), meta.clone());
            index.revision += 1;
            (index.revision, SnapshotWriter::encode(&index.entries)?)
        };
        self.writer.write(revision, snapshot).await?;
        Ok(meta)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let index = self
            .index
            .lock()
            .map_err(|_| CoreError::storage("object index lock poisoned"))?;
        Ok(index
            .entries
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.object_path(path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found(format!("object {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CONTENT_TYPE_CSV;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_list_download() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(dir.path()).unwrap();
        store
            .upload("data_label/labeled_a.csv", b"x".to_vec(), CONTENT_TYPE_CSV)
            .await
            .unwrap();
        store
            .upload("data_prediction/predicted_a.csv", b"y".to_vec(), CONTENT_TYPE_CSV)
            .await
            .unwrap();

        let listed = store.list("data_label/labeled_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "data_label/labeled_a.csv");
        assert_eq!(
            store.download("data_prediction/predicted_a.csv").await.unwrap(),
            b"y".to_vec()
        );
    }

    #[tokio::test]
    async fn test_download_latest_picks_newest() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(dir.path()).unwrap();
        assert!(store.download_latest("data_label/").await.unwrap().is_none());

        store
            .upload("data_label/labeled_z.csv", b"old".to_vec(), CONTENT_TYPE_CSV)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upload("data_label/labeled_a.csv", b"new".to_vec(), CONTENT_TYPE_CSV)
            .await
            .unwrap();

        let (meta, bytes) = store.download_latest("data_label/").await.unwrap().unwrap();
        assert_eq!(meta.name, "data_label/labeled_a.csv");
        assert_eq!(bytes, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalObjectStore::open(dir.path()).unwrap();
            store
                .upload("reports/drift_1.html", b"<html>".to_vec(), "text/html")
                .await
                .unwrap();
        }
        let store = LocalObjectStore::open(dir.path()).unwrap();
        let listed = store.list("reports/").await.unwrap();
        assert_eq!(listed[0].content_type, "text/html");
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(dir.path()).unwrap();
        assert!(store.upload("../x", Vec::new(), "text/plain").await.is_err());
        assert!(store.download("missing.csv").await.unwrap_err().is_not_found());
    }
}
