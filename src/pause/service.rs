//! Pause/resume orchestration over a [`PausedExecutionStore`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::WorkflowError;
use crate::graph::{Workflow, WorkflowSnapshot};

use super::store::{PauseError, PausedExecution, PausedExecutionStore};
use super::wire::SerializedContext;

/// A resumed run, ready to hand back to the executor.
pub struct ResumedExecution {
    pub record_id: String,
    pub workflow: Workflow,
    pub context: ExecutionContext,
    pub suspended_block_id: String,
    pub reason: String,
}

/// Persists suspended runs and reconstructs them for resumption.
pub struct PauseResumeService {
    store: Arc<dyn PausedExecutionStore>,
}

impl PauseResumeService {
    pub fn new(store: Arc<dyn PausedExecutionStore>) -> Self {
        PauseResumeService { store }
    }

    /// Persist a suspended run. Pausing the same execution id again
    /// overwrites the previous record (last write wins) but keeps its
    /// original `created_at`.
    pub async fn pause(
        &self,
        ctx: &ExecutionContext,
        snapshot: &WorkflowSnapshot,
        user_id: &str,
        suspended_block_id: &str,
        reason: &str,
    ) -> Result<PausedExecution, PauseError> {
        let now = Utc::now();
        let existing = self.store.get(&ctx.execution_id).await?;
        let (id, created_at) = match &existing {
            Some(prev) => (prev.id.clone(), prev.created_at),
            None => (Uuid::new_v4().to_string(), now),
        };

        let record = PausedExecution {
            id,
            workflow_id: ctx.workflow_id.clone(),
            execution_id: ctx.execution_id.clone(),
            user_id: user_id.to_string(),
            paused_at: now,
            reason: reason.to_string(),
            suspended_block_id: suspended_block_id.to_string(),
            execution_context: SerializedContext::from(ctx),
            workflow_state: snapshot.clone(),
            environment_variables: ctx.environment_variables.clone(),
            workflow_input: ctx.workflow_input.clone(),
            metadata: ctx.metadata.clone(),
            created_at,
            updated_at: now,
        };

        self.store.upsert(record.clone()).await?;
        info!(
            execution_id = %record.execution_id,
            block_id = %record.suspended_block_id,
            "execution paused"
        );
        Ok(record)
    }

    pub async fn get_paused(
        &self,
        execution_id: &str,
    ) -> Result<Option<PausedExecution>, PauseError> {
        self.store.get(execution_id).await
    }

    pub async fn is_paused(&self, execution_id: &str) -> Result<bool, PauseError> {
        Ok(self.store.get(execution_id).await?.is_some())
    }

    /// All paused runs for a workflow, most recently paused first, optionally
    /// narrowed to a single user.
    pub async fn list_paused(
        &self,
        workflow_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<PausedExecution>, PauseError> {
        let mut records = self.store.list(workflow_id, user_id).await?;
        records.sort_by(|a, b| b.paused_at.cmp(&a.paused_at));
        Ok(records)
    }

    /// Reconstruct a paused run and consume its record. Resumption is
    /// single-use: once this returns a run, the record is gone and a second
    /// resume returns `Ok(None)`.
    ///
    /// `resume_input`, when present, is recorded as the suspended block's
    /// output before the run is handed back, so the executor continues past
    /// the gate instead of suspending again.
    pub async fn resume(
        &self,
        execution_id: &str,
        resume_input: Option<Value>,
    ) -> Result<Option<ResumedExecution>, PauseError> {
        let Some(record) = self.store.get(execution_id).await? else {
            return Ok(None);
        };

        let workflow = Workflow::from_snapshot(record.workflow_state.clone())
            .map_err(|e: WorkflowError| PauseError::Corrupted {
                execution_id: execution_id.to_string(),
                detail: format!("persisted graph failed validation: {}", e),
            })?;

        let mut context = ExecutionContext::from(record.execution_context);
        if let Some(output) = resume_input {
            context.record_success(&record.suspended_block_id, output, 0);
        }

        self.store.remove(execution_id).await?;
        info!(execution_id = %execution_id, "execution resumed");

        Ok(Some(ResumedExecution {
            record_id: record.id,
            workflow,
            context,
            suspended_block_id: record.suspended_block_id,
            reason: record.reason,
        }))
    }

    /// Drop a paused record without resuming. `Ok(true)` if one existed.
    /// When `user_id` is given, a record owned by a different user is left
    /// in place and reported as not found.
    pub async fn delete_paused(
        &self,
        execution_id: &str,
        user_id: Option<&str>,
    ) -> Result<bool, PauseError> {
        if let Some(user) = user_id {
            match self.store.get(execution_id).await? {
                Some(record) if record.user_id != user => return Ok(false),
                Some(_) => {}
                None => return Ok(false),
            }
        }
        self.store.remove(execution_id).await
    }
}
