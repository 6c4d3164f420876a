//! In-memory trigger backends for single-process deployments and tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{ExecutionJob, ExecutionQueue, TriggerError, TriggerLookup, WebhookTrigger};

/// Process-local trigger registry. Lock hold times are short and never span
/// an await, so a sync lock is fine here.
#[derive(Default)]
pub struct MemoryTriggerRegistry {
    triggers: RwLock<Vec<WebhookTrigger>>,
}

impl MemoryTriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, trigger: WebhookTrigger) {
        self.triggers.write().push(trigger);
    }
}

#[async_trait]
impl TriggerLookup for MemoryTriggerRegistry {
    async fn find_by_path(&self, path: &str) -> Result<Option<WebhookTrigger>, TriggerError> {
        Ok(self
            .triggers
            .read()
            .iter()
            .find(|t| t.path == path)
            .cloned())
    }

    async fn find_by_id(&self, webhook_id: &str) -> Result<Option<WebhookTrigger>, TriggerError> {
        Ok(self
            .triggers
            .read()
            .iter()
            .find(|t| t.webhook_id == webhook_id)
            .cloned())
    }
}

/// Queue that collects accepted jobs in memory.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<ExecutionJob>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ExecutionJob> {
        std::mem::take(&mut *self.jobs.lock())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl ExecutionQueue for MemoryQueue {
    async fn enqueue(&self, job: ExecutionJob) -> Result<(), TriggerError> {
        self.jobs.lock().push(job);
        Ok(())
    }
}
