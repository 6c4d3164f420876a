//! Immutable workflow graph model.
//!
//! A [`Workflow`] is the static description of a run: typed [`Block`]s joined
//! by labeled [`Edge`]s, plus iteration policies for loop containers and
//! fan-out policies for parallel containers. Nothing in here is mutated
//! during execution; all per-run state lives in
//! [`ExecutionContext`](crate::context::ExecutionContext).

pub mod builder;
pub mod types;

pub use builder::{Workflow, WorkflowSnapshot};
pub use types::{
    Block, BlockKind, Edge, EdgeLabel, LoopConfig, LoopKind, ParallelConfig, ParallelKind,
};
