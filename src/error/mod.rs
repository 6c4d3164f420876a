//! Error types for the execution engine.
//!
//! - [`BlockError`] — Errors raised during individual block execution.
//! - [`WorkflowError`] — Top-level errors for graph building and running.
//! - [`PauseError`](crate::pause::PauseError) — Errors from the durable
//!   paused-execution store (defined alongside the store).

pub mod block_error;
pub mod workflow_error;

pub use block_error::BlockError;
pub use workflow_error::WorkflowError;

/// Convenience alias for workflow-level results.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
/// Convenience alias for block-level results.
pub type BlockResult<T> = Result<T, BlockError>;
