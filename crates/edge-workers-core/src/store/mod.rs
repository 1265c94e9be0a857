//! Worker metadata and the durable running-set record.
//!
//! The runtime only reads definitions; creating and editing them belongs to
//! the administrative layer. Two implementations are provided:
//! - [`FileStore`]: one directory per worker plus an autostart file
//! - [`MemoryStore`]: in-process maps, for embedding and tests

mod file;
mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edge_workers_common::StoreError;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A registered worker script and its route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDefinition {
    /// Stable identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Path segment(s) the worker is bound to, without leading slash.
    pub route: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Guest source text.
    #[serde(default, skip_serializing)]
    pub code: String,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl WorkerDefinition {
    /// Create a definition stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        route: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            route: route.into(),
            description: String::new(),
            code: code.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Route with surrounding slashes removed.
    pub fn normalized_route(&self) -> &str {
        self.route.trim_matches('/')
    }
}

/// Read access to worker definitions and write access to their source.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Fetch one definition, including its code.
    async fn get_definition(&self, worker_id: &str) -> Result<WorkerDefinition, StoreError>;

    /// All definitions. Code may be left empty; callers needing it use
    /// [`DefinitionStore::read_source`] or [`DefinitionStore::get_definition`].
    async fn list_definitions(&self) -> Result<Vec<WorkerDefinition>, StoreError>;

    /// Guest source of one worker.
    async fn read_source(&self, worker_id: &str) -> Result<String, StoreError>;

    /// Replace the guest source of an existing worker.
    async fn write_source(&self, worker_id: &str, code: &str) -> Result<(), StoreError>;
}

/// Durable record of which workers were running.
#[async_trait]
pub trait RunningSetStore: Send + Sync {
    /// Ids that were running when the record was last saved.
    async fn load_running_ids(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Replace the record.
    async fn save_running_ids(&self, ids: &BTreeSet<String>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_json_omits_code() {
        let def = WorkerDefinition::new("w1", "Hello", "hello", "addEventListener()");
        let json = serde_json::to_value(&def).unwrap();

        assert_eq!(json["route"], "hello");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("code").is_none());
    }

    #[test]
    fn test_normalized_route() {
        let def = WorkerDefinition::new("w1", "Hello", "/api/v1/", "");
        assert_eq!(def.normalized_route(), "api/v1");
    }
}
