//! Durable storage for paused executions.
//!
//! The store holds one record per suspended run, keyed by execution id.
//! Two implementations: an in-memory store for tests and single-process use,
//! and a file store writing one JSON document per record.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::graph::WorkflowSnapshot;

use super::wire::SerializedContext;

#[derive(Error, Debug)]
pub enum PauseError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Paused execution not found: {0}")]
    NotFound(String),

    /// A record exists but cannot be decoded. Surfaced loudly instead of
    /// being treated as absent, so a truncated write is never mistaken for
    /// "nothing paused here".
    #[error("Paused record corrupted for {execution_id}: {detail}")]
    Corrupted {
        execution_id: String,
        detail: String,
    },
}

impl From<std::io::Error> for PauseError {
    fn from(e: std::io::Error) -> Self {
        PauseError::StorageError(e.to_string())
    }
}

/// One persisted paused run: the serialized context plus everything needed
/// to rebuild the executor without consulting any other system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedExecution {
    pub id: String,
    pub workflow_id: String,
    /// Primary key; one paused record per execution.
    pub execution_id: String,
    pub user_id: String,
    pub paused_at: DateTime<Utc>,
    /// Why the run suspended, in `kind:block:detail` form.
    pub reason: String,
    /// Block the run is suspended on.
    pub suspended_block_id: String,
    pub execution_context: SerializedContext,
    /// The graph as it was when the run paused; resume rebuilds from this,
    /// not from a possibly-edited live definition.
    pub workflow_state: WorkflowSnapshot,
    pub environment_variables: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_input: Option<Value>,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence backend for paused executions, keyed by execution id.
#[async_trait]
pub trait PausedExecutionStore: Send + Sync {
    /// Insert or overwrite the record for this execution id.
    async fn upsert(&self, record: PausedExecution) -> Result<(), PauseError>;

    /// `Ok(None)` when no record exists; `Err(Corrupted)` when one exists
    /// but cannot be decoded.
    async fn get(&self, execution_id: &str) -> Result<Option<PausedExecution>, PauseError>;

    /// All records for a workflow, optionally narrowed to one user.
    async fn list(
        &self,
        workflow_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<PausedExecution>, PauseError>;

    /// Remove the record; `Ok(true)` if one existed.
    async fn remove(&self, execution_id: &str) -> Result<bool, PauseError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryPausedStore {
    records: RwLock<HashMap<String, PausedExecution>>,
}

impl MemoryPausedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PausedExecutionStore for MemoryPausedStore {
    async fn upsert(&self, record: PausedExecution) -> Result<(), PauseError> {
        self.records
            .write()
            .await
            .insert(record.execution_id.clone(), record);
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<PausedExecution>, PauseError> {
        Ok(self.records.read().await.get(execution_id).cloned())
    }

    async fn list(
        &self,
        workflow_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<PausedExecution>, PauseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .cloned()
            .collect())
    }

    async fn remove(&self, execution_id: &str) -> Result<bool, PauseError> {
        Ok(self.records.write().await.remove(execution_id).is_some())
    }
}

/// File store: `{execution_id}.paused.json` under a base directory.
pub struct FilePausedStore {
    base_dir: PathBuf,
}

impl FilePausedStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilePausedStore {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.paused.json", execution_id))
    }
}

#[async_trait]
impl PausedExecutionStore for FilePausedStore {
    async fn upsert(&self, record: PausedExecution) -> Result<(), PauseError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(self.path_for(&record.execution_id), json).await?;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<PausedExecution>, PauseError> {
        let path = self.path_for(execution_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            PauseError::Corrupted {
                execution_id: execution_id.to_string(),
                detail: e.to_string(),
            }
        })
    }

    async fn list(
        &self,
        workflow_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<PausedExecution>, PauseError> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".paused.json") {
                continue;
            }
            let data = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<PausedExecution>(&data) {
                Ok(record)
                    if record.workflow_id == workflow_id
                        && user_id.is_none_or(|u| record.user_id == u) =>
                {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e) => {
                    // A bad file must not hide the others from a listing.
                    warn!(file = %name, error = %e, "skipping undecodable paused record");
                }
            }
        }
        Ok(records)
    }

    async fn remove(&self, execution_id: &str) -> Result<bool, PauseError> {
        match tokio::fs::remove_file(self.path_for(execution_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::graph::{Block, BlockKind};

    fn test_record(execution_id: &str, user_id: &str) -> PausedExecution {
        let ctx = ExecutionContext::new("wf1", None);
        let now = Utc::now();
        PausedExecution {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: "wf1".into(),
            execution_id: execution_id.into(),
            user_id: user_id.into(),
            paused_at: now,
            reason: "approval:gate:ok?".into(),
            suspended_block_id: "gate".into(),
            execution_context: SerializedContext::from(&ctx),
            workflow_state: WorkflowSnapshot {
                blocks: vec![Block {
                    id: "start".into(),
                    kind: BlockKind::Starter,
                    name: "Start".into(),
                    block_type: "starter".into(),
                    inputs: IndexMap::new(),
                    parent_id: None,
                }],
                edges: vec![],
                loops: IndexMap::new(),
                parallels: IndexMap::new(),
            },
            environment_variables: IndexMap::new(),
            workflow_input: None,
            metadata: IndexMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryPausedStore::new();
        store.upsert(test_record("e1", "u1")).await.unwrap();

        assert!(store.get("e1").await.unwrap().is_some());
        assert!(store.get("missing").await.unwrap().is_none());
        assert_eq!(store.list("wf1", None).await.unwrap().len(), 1);
        assert_eq!(store.list("wf1", Some("u1")).await.unwrap().len(), 1);
        assert_eq!(store.list("wf1", Some("u2")).await.unwrap().len(), 0);
        assert_eq!(store.list("wf-other", None).await.unwrap().len(), 0);

        assert!(store.remove("e1").await.unwrap());
        assert!(!store.remove("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePausedStore::new(dir.path());

        let record = test_record("e1", "u1");
        store.upsert(record.clone()).await.unwrap();

        let loaded = store.get("e1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("nope").await.unwrap().is_none());

        assert!(store.remove("e1").await.unwrap());
        assert!(store.get("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePausedStore::new(dir.path());
        tokio::fs::write(dir.path().join("bad.paused.json"), "{not json")
            .await
            .unwrap();

        assert!(matches!(
            store.get("bad").await,
            Err(PauseError::Corrupted { .. })
        ));
    }
}
