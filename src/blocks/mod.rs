//! Block executors and the executor registry.
//!
//! Each executable block type implements [`BlockExecutor`]. The registry is
//! an explicit value constructed at process start and passed by reference
//! into the engine, so tests can run against fixture registries. Loop and
//! parallel containers are structural and never appear here; the engine
//! resolves them by pattern matching on [`BlockKind`](crate::graph::BlockKind).

pub mod control_flow;
pub mod gates;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::BlockError;

/// Read-only run parameters visible to every block execution. Cheap to clone
/// into parallel branch tasks.
#[derive(Debug, Clone, Default)]
pub struct BlockScope {
    pub workflow_input: Option<Value>,
    pub environment: Arc<IndexMap<String, String>>,
}

/// How a block finished.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Completed,
    /// Router: chosen target block id. Condition: chosen outcome handle.
    Branch(String),
    /// The block is a suspension point; traversal stops here and the run is
    /// handed to the pause service.
    Suspend { reason: String },
}

/// Result of one block execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRunResult {
    pub output: Value,
    pub outcome: BlockOutcome,
}

impl BlockRunResult {
    pub fn completed(output: Value) -> Self {
        BlockRunResult {
            output,
            outcome: BlockOutcome::Completed,
        }
    }

    pub fn branch(output: Value, handle: impl Into<String>) -> Self {
        BlockRunResult {
            output,
            outcome: BlockOutcome::Branch(handle.into()),
        }
    }

    pub fn suspend(reason: impl Into<String>) -> Self {
        BlockRunResult {
            output: Value::Null,
            outcome: BlockOutcome::Suspend {
                reason: reason.into(),
            },
        }
    }
}

/// Trait for block execution. Each executable block type implements this.
/// `inputs` arrive with all reference tokens already resolved.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(
        &self,
        block_id: &str,
        inputs: &Value,
        scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError>;
}

/// Registry of block executors by block type string.
pub struct BlockExecutorRegistry {
    executors: HashMap<String, Box<dyn BlockExecutor>>,
}

impl BlockExecutorRegistry {
    pub fn new() -> Self {
        let mut registry = BlockExecutorRegistry {
            executors: HashMap::new(),
        };
        registry.register("starter", Box::new(control_flow::StarterExecutor));
        registry.register("router", Box::new(control_flow::RouterExecutor));
        registry.register("condition", Box::new(control_flow::ConditionExecutor));
        registry.register("approval", Box::new(gates::ApprovalExecutor));
        registry.register("wait", Box::new(gates::WaitGateExecutor));
        registry
    }

    pub fn register(&mut self, block_type: &str, executor: Box<dyn BlockExecutor>) {
        self.executors.insert(block_type.to_string(), executor);
    }

    pub fn get(&self, block_type: &str) -> Option<&dyn BlockExecutor> {
        self.executors.get(block_type).map(|e| e.as_ref())
    }
}

impl Default for BlockExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
