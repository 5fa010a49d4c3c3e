//! Durable run records, keyed by run id.
//!
//! Each run is written independently, so saving one run never touches
//! another's record. Terminal runs (`Done`/`Failed`) are immutable once
//! stored; a later attempt to overwrite one is rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::run::PipelineRun;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {0} is terminal and cannot be overwritten")]
    Immutable(Uuid),

    #[error("run store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt run record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for PublishError {
    fn from(e: StoreError) -> Self {
        PublishError::Store {
            message: e.to_string(),
        }
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn load(&self, run_id: Uuid) -> Result<PipelineRun, StoreError>;

    /// Runs that are neither `Done` nor `Failed`, oldest first.
    async fn list_incomplete(&self) -> Result<Vec<PipelineRun>, StoreError>;

    /// Every stored run, oldest first.
    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError>;
}

/// One JSON file per run under a directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileRunStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read(path: &Path) -> Result<PipelineRun, StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn read_all(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(run) => runs.push(run),
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(error = %e, "Skipping unreadable run record");
                }
                Err(e) => return Err(e),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let path = self.path_for(run.run_id);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| StoreError::Io { path, source }
        };

        if let Ok(existing) = Self::read(&path).await {
            if existing.is_terminal() && existing != *run {
                return Err(StoreError::Immutable(run.run_id));
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;
        let json = serde_json::to_vec_pretty(run).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = self.dir.join(format!(".{}.json.tmp", run.run_id));
        tokio::fs::write(&tmp, &json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_err(&path))?;
        debug!(run_id = %run.run_id, stage = %run.current_stage(), path = %path.display(), "Run saved");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        let path = self.path_for(run_id);
        match Self::read(&path).await {
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(run_id))
            }
            other => other,
        }
    }

    async fn list_incomplete(&self) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        self.read_all().await
    }
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, PipelineRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, keep: impl Fn(&PipelineRun) -> bool) -> Vec<PipelineRun> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = runs.values().filter(|r| keep(r)).cloned().collect();
        out.sort_by_key(|r| r.created_at);
        out
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = runs.get(&run.run_id) {
            if existing.is_terminal() && existing != run {
                return Err(StoreError::Immutable(run.run_id));
            }
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(&run_id).cloned().ok_or(StoreError::NotFound(run_id))
    }

    async fn list_incomplete(&self) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self.sorted(|r| !r.is_terminal()))
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self.sorted(|_| true))
    }
}
