//! blockflow — a workflow execution engine.
//!
//! Workflows are directed graphs of typed blocks connected by labeled edges.
//! The executor walks the graph in readiness order, prunes branches cut off
//! by router/condition decisions, re-enters loop container bodies once per
//! iteration, fans parallel container bodies out across concurrent branch
//! tasks, and can suspend at gate blocks. A suspended run serializes to a
//! single durable record and resumes later with full fidelity, including the
//! insertion order of every map and set in its context. Inbound webhook
//! events are authenticated and normalized by the trigger dispatcher before
//! they become execution jobs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use blockflow::blocks::BlockExecutorRegistry;
//! use blockflow::context::ExecutionContext;
//! use blockflow::executor::Executor;
//! use blockflow::graph::{Workflow, WorkflowSnapshot};
//!
//! # async fn run(snapshot: WorkflowSnapshot) -> blockflow::error::WorkflowResult<()> {
//! let workflow = Arc::new(Workflow::from_snapshot(snapshot)?);
//! let registry = Arc::new(BlockExecutorRegistry::new());
//! let executor = Executor::new(workflow, registry);
//!
//! let mut ctx = ExecutionContext::new("my-workflow", None);
//! let outcome = executor.run(&mut ctx).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod pause;
pub mod resolver;
pub mod trigger;

pub use blocks::{BlockExecutor, BlockExecutorRegistry, BlockOutcome, BlockRunResult, BlockScope};
pub use context::ExecutionContext;
pub use error::{BlockError, WorkflowError, WorkflowResult};
pub use executor::{EngineConfig, EventEmitter, ExecutionEvent, ExecutionOutcome, Executor};
pub use graph::{Block, BlockKind, Edge, EdgeLabel, Workflow, WorkflowSnapshot};
pub use pause::{PauseError, PauseResumeService, PausedExecutionStore};
pub use trigger::{DispatchResponse, TriggerDispatcher, TriggerRequest};
