//! Workflow-level error types.

use super::BlockError;
use thiserror::Error;

/// Workflow-level errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Graph build error: {0}")]
    GraphBuildError(String),
    #[error("Graph validation error: {0}")]
    GraphValidationError(String),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Block executor not found for type: {0}")]
    ExecutorNotFound(String),
    #[error("No starter block found")]
    NoStarterBlock,
    #[error("Multiple starter blocks found")]
    MultipleStarterBlocks,
    #[error("Execution timeout")]
    ExecutionTimeout,
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(i32),
    #[error("Workflow cancelled")]
    Cancelled,
    #[error("Block execution error: block={block_id}, error={error}")]
    BlockExecutionError { block_id: String, error: String },
    #[error("Block error: {0}")]
    BlockError(Box<BlockError>),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<BlockError> for WorkflowError {
    fn from(value: BlockError) -> Self {
        WorkflowError::BlockError(Box::new(value))
    }
}
