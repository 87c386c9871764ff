//! Workflow persistence seam.
//!
//! Definitions are versioned documents keyed by UUID. The storage
//! collaborator is external by contract — this module provides the trait
//! plus a file-backed reference implementation (one JSON document per
//! workflow) and an in-memory store for tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use toolmesh_core::error::WorkflowError;

use crate::definition::WorkflowDefinition;

/// Load/save/list access to persisted workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load(&self, uuid: &Uuid) -> Result<WorkflowDefinition, WorkflowError>;

    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError>;

    /// List definitions; with `active_only`, soft-deleted (`active = false`)
    /// definitions are excluded — this is the listing scheduled and
    /// on-demand execution must use.
    async fn list(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>, WorkflowError>;

    async fn delete(&self, uuid: &Uuid) -> Result<(), WorkflowError>;
}

/// One JSON document per workflow under a configured directory.
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(format!("{uuid}.json"))
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn load(&self, uuid: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        let path = self.path_for(uuid);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| WorkflowError::NotFound(uuid.to_string()))?;
        serde_json::from_str(&raw)
            .map_err(|e| WorkflowError::Storage(format!("corrupt document {uuid}: {e}")))
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WorkflowError::Storage(e.to_string()))?;
        let raw = serde_json::to_string_pretty(definition)
            .map_err(|e| WorkflowError::Storage(e.to_string()))?;
        tokio::fs::write(self.path_for(&definition.uuid), raw)
            .await
            .map_err(|e| WorkflowError::Storage(e.to_string()))
    }

    async fn list(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // A store that was never written to is just empty.
            Err(_) => return Ok(Vec::new()),
        };

        let mut definitions = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable workflow");
                    continue;
                }
            };
            match serde_json::from_str::<WorkflowDefinition>(&raw) {
                Ok(definition) => {
                    if !active_only || definition.active {
                        definitions.push(definition);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt workflow");
                }
            }
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn delete(&self, uuid: &Uuid) -> Result<(), WorkflowError> {
        tokio::fs::remove_file(self.path_for(uuid))
            .await
            .map_err(|_| WorkflowError::NotFound(uuid.to_string()))
    }
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    definitions: RwLock<HashMap<Uuid, WorkflowDefinition>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn load(&self, uuid: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.definitions
            .read()
            .await
            .get(uuid)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(uuid.to_string()))
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        self.definitions
            .write()
            .await
            .insert(definition.uuid, definition.clone());
        Ok(())
    }

    async fn list(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let mut definitions: Vec<WorkflowDefinition> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| !active_only || d.active)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn delete(&self, uuid: &Uuid) -> Result<(), WorkflowError> {
        self.definitions
            .write()
            .await
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| WorkflowError::NotFound(uuid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowStep;

    fn sample(name: &str, active: bool) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(
            name,
            vec![WorkflowStep::Start {
                variables: serde_json::Map::new(),
            }],
        );
        definition.active = active;
        definition
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path());

        let definition = sample("digest", true);
        store.save(&definition).await.unwrap();

        let loaded = store.load(&definition.uuid).await.unwrap();
        assert_eq!(loaded.name, "digest");
        assert_eq!(loaded.uuid, definition.uuid);
    }

    #[tokio::test]
    async fn file_store_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path());
        let err = store.load(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn active_only_excludes_soft_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path());

        store.save(&sample("alive", true)).await.unwrap();
        store.save(&sample("deleted", false)).await.unwrap();

        let all = store.list(false).await.unwrap();
        assert_eq!(all.len(), 2);

        let active = store.list(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "alive");
    }

    #[tokio::test]
    async fn corrupt_documents_are_skipped_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path());
        store.save(&sample("good", true)).await.unwrap();
        std::fs::write(dir.path().join("junk.json"), "{ nope").unwrap();

        let listed = store.list(false).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_behaves_like_file_store() {
        let store = MemoryWorkflowStore::new();
        let definition = sample("mem", true);
        store.save(&definition).await.unwrap();

        assert_eq!(store.list(true).await.unwrap().len(), 1);
        store.delete(&definition.uuid).await.unwrap();
        assert!(store.load(&definition.uuid).await.is_err());
    }

    #[tokio::test]
    async fn save_overwrites_in_place() {
        let store = MemoryWorkflowStore::new();
        let mut definition = sample("v1", true);
        store.save(&definition).await.unwrap();

        definition.name = "v2".into();
        store.save(&definition).await.unwrap();

        let loaded = store.load(&definition.uuid).await.unwrap();
        assert_eq!(loaded.name, "v2");
        assert_eq!(store.list(false).await.unwrap().len(), 1);
    }
}
