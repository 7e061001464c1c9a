//! Shared persistence utilities: atomic file writes, JSON load/save.
//!
//! The local tracking backend and the local object store both keep their
//! state on disk; every write goes through the write-then-rename pattern here,
//! on the blocking pool so no runtime worker waits on the filesystem.

use std::io;
use std::path::{Path, PathBuf};

/// Writes numbered snapshots of an in-memory state to one file.
///
/// Callers take the snapshot under their own state lock and hand it over
/// after releasing it. Writes run on the blocking pool one at a time, and a
/// snapshot older than the last one written is dropped, so the file always
/// ends at the newest state.
pub struct SnapshotWriter {
    path: PathBuf,
    written: tokio::sync::Mutex<u64>,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: tokio::sync::Mutex::new(0),
        }
    }

    /// Serialize `data` as pretty JSON. Call while holding the state lock.
    pub fn encode<T: serde::Serialize>(data: &T) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(data).map_err(io::Error::other)
    }

    pub async fn write(&self, revision: u64, bytes: Vec<u8>) -> io::Result<()> {
        let mut written = self.written.lock().await;
        if *written >= revision {
            return Ok(());
        }
        write_blocking(self.path.clone(), bytes).await?;
        *written = revision;
        Ok(())
    }
}

/// [`atomic_write`] on the blocking pool.
pub async fn write_blocking(path: PathBuf, data: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || atomic_write(&path, &data))
        .await
        .map_err(io::Error::other)?
}

/// Write `data` to a `.tmp` sibling and rename it over `path`, so readers
/// never observe a half-written state file or artifact.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = match path.extension() {
        Some(ext) => path.with_extension(format!("{}.tmp", ext.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `Ok(None)` when nothing has been persisted at `path` yet.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct State {
        name: String,
        versions: Vec<u32>,
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let data = State {
            name: "sentiment".into(),
            versions: vec![1, 2],
        };

        let writer = SnapshotWriter::new(&path);
        writer.write(1, SnapshotWriter::encode(&data).unwrap()).await.unwrap();
        let loaded: Option<State> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let newer = State {
            name: "newer".into(),
            versions: vec![2],
        };
        let older = State {
            name: "older".into(),
            versions: vec![1],
        };

        let writer = SnapshotWriter::new(&path);
        writer.write(2, SnapshotWriter::encode(&newer).unwrap()).await.unwrap();
        writer.write(1, SnapshotWriter::encode(&older).unwrap()).await.unwrap();
        let loaded: Option<State> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(newer));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifacts").join("run-1").join("model.json");
        atomic_write(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<State> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let result: io::Result<Option<State>> = load_json(&path);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
