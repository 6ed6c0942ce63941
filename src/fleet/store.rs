//! `WorkerStore` trait: durable storage for the worker directory.
//!
//! The directory is small (tens of workers), so every save rewrites the whole
//! document. A batched or debounced backend can sit behind the same trait.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::FleetError;
use crate::fleet::model::Worker;

const DIRECTORY_VERSION: u32 = 1;

/// Backend-agnostic storage for worker records.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Load every persisted worker. A missing store is an empty directory.
    async fn load(&self) -> Result<Vec<Worker>, FleetError>;

    /// Replace the persisted directory with `workers`.
    async fn save(&self, workers: &[Worker]) -> Result<(), FleetError>;
}

/// On-disk document shape.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerDirectory {
    version: u32,
    workers: Vec<Worker>,
}

/// A single JSON document on the local filesystem.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persistence_error(&self, reason: impl ToString) -> FleetError {
        FleetError::Persistence {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl WorkerStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Worker>, FleetError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let directory: WorkerDirectory = serde_json::from_str(&raw)?;
        Ok(directory.workers)
    }

    async fn save(&self, workers: &[Worker]) -> Result<(), FleetError> {
        let directory = WorkerDirectory {
            version: DIRECTORY_VERSION,
            workers: workers.to_vec(),
        };
        let json = serde_json::to_string_pretty(&directory)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persistence_error(e))?;
        }

        // Write-then-rename so a crash never leaves a half-written directory.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| self.persistence_error(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persistence_error(e))?;
        Ok(())
    }
}

/// In-memory store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workers: Mutex<Vec<Worker>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the store, as if a previous process had saved these.
    pub fn with_workers(workers: Vec<Worker>) -> Self {
        Self {
            workers: Mutex::new(workers),
            saves: Mutex::new(0),
        }
    }

    /// Snapshot of what was last saved.
    pub fn snapshot(&self) -> Vec<Worker> {
        self.workers.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Number of saves performed.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|s| *s).unwrap_or(0)
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Worker>, FleetError> {
        Ok(self.snapshot())
    }

    async fn save(&self, workers: &[Worker]) -> Result<(), FleetError> {
        if let Ok(mut stored) = self.workers.lock() {
            *stored = workers.to_vec();
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::model::{Capabilities, ConnectionHandle, WorkerStatus};

    fn worker(hostname: &str) -> Worker {
        Worker::new(
            hostname,
            "test box",
            Capabilities {
                hostname: hostname.into(),
                os: "linux".into(),
                tools: vec!["command".into()],
                ..Default::default()
            },
            vec!["lab".into()],
        )
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("workers.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/workers.json"));

        let mut w = worker("garage");
        w.status = WorkerStatus::Online;
        let (handle, _rx) = ConnectionHandle::new();
        w.connection = Some(handle);
        store.save(&[w.clone()]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, w.id);
        assert_eq!(loaded[0].tags, vec!["lab".to_string()]);
        assert!(loaded[0].connection.is_none());

        // No temp file left behind.
        assert!(!dir.path().join("nested/workers.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(FleetError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        store.save(&[worker("a")]).await.unwrap();
        store.save(&[worker("a"), worker("b")]).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.snapshot().len(), 2);
    }
}
