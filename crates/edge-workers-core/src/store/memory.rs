use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use edge_workers_common::StoreError;

use super::{DefinitionStore, RunningSetStore, WorkerDefinition};

/// In-memory definitions and running-set record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    definitions: DashMap<String, WorkerDefinition>,
    running: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition.
    pub fn insert(&self, definition: WorkerDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    /// Insert a definition built from its parts; the name defaults to the id.
    pub fn with_worker(self, id: &str, route: &str, code: &str) -> Self {
        self.insert(WorkerDefinition::new(id, id, route, code));
        self
    }

    /// Remove a definition.
    pub fn remove(&self, worker_id: &str) -> Option<WorkerDefinition> {
        self.definitions.remove(worker_id).map(|(_, def)| def)
    }

    /// Current running-set record.
    pub fn running_ids(&self) -> BTreeSet<String> {
        self.running.lock().clone()
    }

    /// Overwrite the running-set record.
    pub fn set_running_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.running.lock() = ids.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn get_definition(&self, worker_id: &str) -> Result<WorkerDefinition, StoreError> {
        self.definitions
            .get(worker_id)
            .map(|def| def.clone())
            .ok_or_else(|| StoreError::NotFound {
                worker_id: worker_id.to_string(),
            })
    }

    async fn list_definitions(&self) -> Result<Vec<WorkerDefinition>, StoreError> {
        let mut defs: Vec<WorkerDefinition> =
            self.definitions.iter().map(|def| def.clone()).collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn read_source(&self, worker_id: &str) -> Result<String, StoreError> {
        self.get_definition(worker_id).await.map(|def| def.code)
    }

    async fn write_source(&self, worker_id: &str, code: &str) -> Result<(), StoreError> {
        let mut def = self
            .definitions
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::NotFound {
                worker_id: worker_id.to_string(),
            })?;
        def.code = code.to_string();
        def.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RunningSetStore for MemoryStore {
    async fn load_running_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.running_ids())
    }

    async fn save_running_ids(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        *self.running.lock() = ids.clone();
        Ok(())
    }
}
