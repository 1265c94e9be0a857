use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use edge_workers_common::StoreError;

use super::{DefinitionStore, RunningSetStore, WorkerDefinition};

const CONFIG_FILE: &str = "config.json";
const SOURCE_FILE: &str = "worker.js";

/// Directory-backed store.
///
/// Layout:
///
/// ```text
/// workers_dir/
///   <id>/config.json   metadata (camelCase JSON, no code)
///   <id>/worker.js     guest source
/// autostart_file       {"workerIds": [...], "lastUpdate": "..."}
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    workers_dir: PathBuf,
    autostart_file: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningSetRecord {
    worker_ids: Vec<String>,
    last_update: DateTime<Utc>,
}

impl FileStore {
    /// Create a store rooted at `workers_dir` with the running set in `autostart_file`.
    pub fn new(workers_dir: impl Into<PathBuf>, autostart_file: impl Into<PathBuf>) -> Self {
        Self {
            workers_dir: workers_dir.into(),
            autostart_file: autostart_file.into(),
        }
    }

    /// Directory holding the worker sub-directories.
    pub fn workers_dir(&self) -> &Path {
        &self.workers_dir
    }

    /// Persist a full definition, creating its directory. Used by the
    /// administrative layer and by tests.
    pub async fn put_definition(&self, definition: &WorkerDefinition) -> Result<(), StoreError> {
        let dir = self.worker_dir(&definition.id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let config_path = dir.join(CONFIG_FILE);
        let json = serde_json::to_vec_pretty(definition)
            .map_err(|e| StoreError::corrupt(&config_path, e.to_string()))?;
        fs::write(&config_path, json)
            .await
            .map_err(|e| StoreError::io(&config_path, e))?;

        let source_path = dir.join(SOURCE_FILE);
        fs::write(&source_path, definition.code.as_bytes())
            .await
            .map_err(|e| StoreError::io(&source_path, e))
    }

    fn worker_dir(&self, worker_id: &str) -> Result<PathBuf, StoreError> {
        // Ids name directories; never let one escape `workers_dir`.
        if worker_id.is_empty()
            || worker_id.contains(['/', '\\'])
            || worker_id == "."
            || worker_id == ".."
        {
            return Err(StoreError::NotFound {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(self.workers_dir.join(worker_id))
    }

    async fn read_metadata(&self, worker_id: &str) -> Result<WorkerDefinition, StoreError> {
        let path = self.worker_dir(worker_id)?.join(CONFIG_FILE);
        let raw = fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                worker_id: worker_id.to_string(),
            },
            _ => StoreError::io(&path, e),
        })?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::corrupt(&path, e.to_string()))
    }

    async fn write_running_record(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        let record = RunningSetRecord {
            worker_ids: ids.iter().cloned().collect(),
            last_update: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| StoreError::corrupt(&self.autostart_file, e.to_string()))?;

        if let Some(parent) = self.autostart_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        fs::write(&self.autostart_file, json)
            .await
            .map_err(|e| StoreError::io(&self.autostart_file, e))
    }
}

#[async_trait]
impl DefinitionStore for FileStore {
    async fn get_definition(&self, worker_id: &str) -> Result<WorkerDefinition, StoreError> {
        let mut definition = self.read_metadata(worker_id).await?;
        definition.code = self.read_source(worker_id).await?;
        Ok(definition)
    }

    async fn list_definitions(&self) -> Result<Vec<WorkerDefinition>, StoreError> {
        let mut entries = match fs::read_dir(&self.workers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.workers_dir, e)),
        };

        let mut definitions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.workers_dir, e))?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(worker_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.read_metadata(&worker_id).await {
                Ok(definition) => definitions.push(definition),
                Err(StoreError::NotFound { .. }) => {
                    debug!(worker_id = %worker_id, "Skipping directory without config.json");
                }
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Skipping unreadable worker"),
            }
        }

        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn read_source(&self, worker_id: &str) -> Result<String, StoreError> {
        let path = self.worker_dir(worker_id)?.join(SOURCE_FILE);
        match fs::read_to_string(&path).await {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                worker_id: worker_id.to_string(),
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn write_source(&self, worker_id: &str, code: &str) -> Result<(), StoreError> {
        let mut definition = self.read_metadata(worker_id).await?;
        let dir = self.worker_dir(worker_id)?;

        let source_path = dir.join(SOURCE_FILE);
        fs::write(&source_path, code.as_bytes())
            .await
            .map_err(|e| StoreError::io(&source_path, e))?;

        definition.updated_at = Utc::now();
        let config_path = dir.join(CONFIG_FILE);
        let json = serde_json::to_vec_pretty(&definition)
            .map_err(|e| StoreError::corrupt(&config_path, e.to_string()))?;
        fs::write(&config_path, json)
            .await
            .map_err(|e| StoreError::io(&config_path, e))
    }
}

#[async_trait]
impl RunningSetStore for FileStore {
    async fn load_running_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let raw = match fs::read(&self.autostart_file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write_running_record(&BTreeSet::new()).await?;
                return Ok(BTreeSet::new());
            }
            Err(e) => return Err(StoreError::io(&self.autostart_file, e)),
        };

        match serde_json::from_slice::<RunningSetRecord>(&raw) {
            Ok(record) => Ok(record.worker_ids.into_iter().collect()),
            Err(e) => {
                warn!(
                    path = %self.autostart_file.display(),
                    error = %e,
                    "Running-set record is corrupt, resetting"
                );
                self.write_running_record(&BTreeSet::new()).await?;
                Ok(BTreeSet::new())
            }
        }
    }

    async fn save_running_ids(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        self.write_running_record(ids).await
    }
}
