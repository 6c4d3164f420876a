//! Starter, router, and condition executors.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BlockError;

use super::{BlockExecutor, BlockRunResult, BlockScope};

/// Entry block. Publishes the workflow input as its output so downstream
/// blocks can reference it.
pub struct StarterExecutor;

#[async_trait]
impl BlockExecutor for StarterExecutor {
    async fn execute(
        &self,
        _block_id: &str,
        inputs: &Value,
        scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        let mut output = serde_json::Map::new();
        output.insert(
            "input".to_string(),
            scope.workflow_input.clone().unwrap_or(Value::Null),
        );
        if let Some(obj) = inputs.as_object() {
            for (key, value) in obj {
                output.insert(key.clone(), value.clone());
            }
        }
        Ok(BlockRunResult::completed(Value::Object(output)))
    }
}

/// Multi-output block that selects exactly one downstream target, named in
/// its resolved `target` input.
pub struct RouterExecutor;

#[async_trait]
impl BlockExecutor for RouterExecutor {
    async fn execute(
        &self,
        block_id: &str,
        inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        let target = inputs
            .get("target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BlockError::ConfigError(format!("router {} has no resolved target", block_id))
            })?
            .to_string();

        let output = serde_json::json!({ "selected": target });
        Ok(BlockRunResult::branch(output, target))
    }
}

/// Evaluates an ordered list of conditions and selects the outcome handle of
/// the first truthy one. An entry without a `value` acts as the else branch.
///
/// ```json
/// { "conditions": [
///     { "id": "high", "value": true },
///     { "id": "else" }
/// ] }
/// ```
pub struct ConditionExecutor;

#[async_trait]
impl BlockExecutor for ConditionExecutor {
    async fn execute(
        &self,
        block_id: &str,
        inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        let conditions = inputs
            .get("conditions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                BlockError::ConfigError(format!("condition {} has no conditions list", block_id))
            })?;

        for entry in conditions {
            let id = entry.get("id").and_then(|v| v.as_str()).ok_or_else(|| {
                BlockError::ConfigError(format!("condition entry in {} missing id", block_id))
            })?;

            let selected = match entry.get("value") {
                None => true,
                Some(Value::Bool(b)) => *b,
                Some(Value::Null) => false,
                Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
                Some(Value::String(s)) => !s.is_empty() && s != "false",
                Some(other) => {
                    return Err(BlockError::TypeError(format!(
                        "condition {} entry {} has non-scalar value: {}",
                        block_id, id, other
                    )));
                }
            };

            if selected {
                let output = serde_json::json!({ "selected_condition": id });
                return Ok(BlockRunResult::branch(output, id.to_string()));
            }
        }

        Err(BlockError::ExecutionError(format!(
            "condition {} matched no condition and has no else entry",
            block_id
        )))
    }
}
