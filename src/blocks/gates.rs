//! Suspending blocks: human-approval gates and long external waits.
//!
//! These are the only block types that signal `Suspend` instead of
//! `Completed`, so a suspended run always sits at a well-defined boundary
//! between finished and not-yet-started blocks. The engine stops traversal
//! and hands the context to the pause service; on resume the service injects
//! the gate's outcome before re-running (see
//! [`PauseResumeService::resume`](crate::pause::PauseResumeService::resume)).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BlockError;

use super::{BlockExecutor, BlockRunResult, BlockScope};

/// Human-approval gate.
pub struct ApprovalExecutor;

#[async_trait]
impl BlockExecutor for ApprovalExecutor {
    async fn execute(
        &self,
        block_id: &str,
        inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        let prompt = inputs
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or("approval required");
        Ok(BlockRunResult::suspend(format!(
            "approval:{}:{}",
            block_id, prompt
        )))
    }
}

/// Wait gate for long external operations; suspends until an external signal
/// resumes the run.
pub struct WaitGateExecutor;

#[async_trait]
impl BlockExecutor for WaitGateExecutor {
    async fn execute(
        &self,
        block_id: &str,
        inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        let event = inputs
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("external");
        Ok(BlockRunResult::suspend(format!(
            "wait:{}:{}",
            block_id, event
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockOutcome;
    use serde_json::json;

    #[tokio::test]
    async fn test_approval_suspends() {
        let result = ApprovalExecutor
            .execute("gate", &json!({"prompt": "ship it?"}), &BlockScope::default())
            .await
            .unwrap();
        assert!(matches!(
            result.outcome,
            BlockOutcome::Suspend { ref reason } if reason.contains("ship it?")
        ));
    }

    #[tokio::test]
    async fn test_wait_gate_suspends() {
        let result = WaitGateExecutor
            .execute("w", &json!({}), &BlockScope::default())
            .await
            .unwrap();
        assert!(matches!(result.outcome, BlockOutcome::Suspend { .. }));
    }
}
