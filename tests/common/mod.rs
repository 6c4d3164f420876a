//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use blockflow::blocks::{BlockExecutor, BlockExecutorRegistry, BlockRunResult, BlockScope};
use blockflow::error::BlockError;
use blockflow::graph::{Block, BlockKind, Edge, EdgeLabel};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("blockflow=debug")
        .try_init();
}

pub fn block(id: &str, kind: BlockKind, block_type: &str) -> Block {
    Block {
        id: id.to_string(),
        kind,
        name: id.to_string(),
        block_type: block_type.to_string(),
        inputs: IndexMap::new(),
        parent_id: None,
    }
}

pub fn block_with_inputs(id: &str, kind: BlockKind, block_type: &str, inputs: Value) -> Block {
    let mut b = block(id, kind, block_type);
    if let Value::Object(map) = inputs {
        b.inputs = map.into_iter().collect();
    }
    b
}

pub fn child_of(mut b: Block, parent: &str) -> Block {
    b.parent_id = Some(parent.to_string());
    b
}

pub fn edge(source: &str, target: &str) -> Edge {
    Edge {
        source: source.to_string(),
        target: target.to_string(),
        label: None,
    }
}

pub fn labeled_edge(source: &str, target: &str, label: EdgeLabel) -> Edge {
    Edge {
        source: source.to_string(),
        target: target.to_string(),
        label: Some(label),
    }
}

/// Completes with its resolved inputs as output.
pub struct EchoExecutor;

#[async_trait]
impl BlockExecutor for EchoExecutor {
    async fn execute(
        &self,
        _block_id: &str,
        inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        Ok(BlockRunResult::completed(inputs.clone()))
    }
}

/// Always fails.
pub struct FailExecutor;

#[async_trait]
impl BlockExecutor for FailExecutor {
    async fn execute(
        &self,
        block_id: &str,
        _inputs: &Value,
        _scope: &BlockScope,
    ) -> Result<BlockRunResult, BlockError> {
        Err(BlockError::ExecutionError(format!(
            "{} failed on purpose",
            block_id
        )))
    }
}

pub fn test_registry() -> BlockExecutorRegistry {
    let mut registry = BlockExecutorRegistry::new();
    registry.register("echo", Box::new(EchoExecutor));
    registry.register("fail", Box::new(FailExecutor));
    registry
}
