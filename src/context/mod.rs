//! Per-run mutable execution state.
//!
//! One [`ExecutionContext`] is constructed per run and is the sole mutable
//! object threaded through the executor. The graph itself is never mutated.
//! Every associative field is an insertion-ordered map/set so a paused run
//! can be persisted and resumed with full fidelity (see [`crate::pause`]).

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use uuid::Uuid;

use crate::graph::{LoopKind, ParallelKind};

/// Recorded outcome of one block execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockState {
    pub output: Value,
    pub executed: bool,
    pub execution_time_ms: u64,
}

impl BlockState {
    pub fn success(output: Value, execution_time_ms: u64) -> Self {
        BlockState {
            output,
            executed: true,
            execution_time_ms,
        }
    }

    pub fn failure(message: String, execution_time_ms: u64) -> Self {
        BlockState {
            output: serde_json::json!({ "error": message }),
            executed: true,
            execution_time_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.output.get("error").is_some()
    }
}

/// Router and condition outcomes, kept distinct because the two decision
/// kinds have different evaluation semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decisions {
    /// Router block id → chosen next-block id.
    pub router: IndexMap<String, String>,
    /// Condition block id → chosen next-block id.
    pub condition: IndexMap<String, String>,
}

/// Iteration bookkeeping for one loop container.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopExecution {
    pub max_iterations: u32,
    pub kind: LoopKind,
    pub for_each_items: Option<Vec<Value>>,
    /// Per-iteration results, keyed by iteration index. Insertion order is
    /// iteration order.
    pub execution_results: IndexMap<u32, Value>,
    pub current_iteration: u32,
}

impl LoopExecution {
    pub fn from_kind(kind: LoopKind) -> Self {
        let (max_iterations, for_each_items) = match &kind {
            LoopKind::Fixed(n) => (*n, None),
            LoopKind::ForEach(items) => (items.len() as u32, Some(items.clone())),
        };
        LoopExecution {
            max_iterations,
            kind,
            for_each_items,
            execution_results: IndexMap::new(),
            current_iteration: 0,
        }
    }
}

/// Fan-out bookkeeping for one parallel container.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelExecution {
    pub parallel_count: u32,
    pub distribution_items: Option<Vec<Value>>,
    pub completed_executions: u32,
    /// Per-branch results, keyed by branch index.
    pub execution_results: IndexMap<u32, Value>,
    /// Branch indices currently in flight.
    pub active_iterations: IndexSet<u32>,
    pub current_iteration: u32,
    pub kind: ParallelKind,
}

impl ParallelExecution {
    pub fn from_kind(kind: ParallelKind) -> Self {
        let (parallel_count, distribution_items) = match &kind {
            ParallelKind::Fixed(n) => (*n, None),
            ParallelKind::ForEach(items) => (items.len() as u32, Some(items.clone())),
        };
        ParallelExecution {
            parallel_count,
            distribution_items,
            completed_executions: 0,
            execution_results: IndexMap::new(),
            active_iterations: IndexSet::new(),
            current_iteration: 0,
            kind,
        }
    }
}

/// The full mutable state of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub workflow_id: String,
    /// Unique per run; the resume key.
    pub execution_id: String,

    pub block_states: IndexMap<String, BlockState>,
    pub decisions: Decisions,

    pub loop_iterations: IndexMap<String, u32>,
    pub loop_items: IndexMap<String, Value>,
    pub completed_loops: IndexSet<String>,
    /// Present only for workflows that contain loop containers.
    pub loop_executions: Option<IndexMap<String, LoopExecution>>,
    /// Present only for workflows that contain parallel containers.
    pub parallel_executions: Option<IndexMap<String, ParallelExecution>>,
    /// Virtual block id → template block id for parallel branch instances.
    pub parallel_block_mapping: IndexMap<String, String>,

    pub executed_blocks: IndexSet<String>,
    pub active_execution_path: IndexSet<String>,

    pub environment_variables: IndexMap<String, String>,
    pub workflow_variables: IndexMap<String, Value>,
    pub workflow_input: Option<Value>,
    pub metadata: IndexMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, workflow_input: Option<Value>) -> Self {
        ExecutionContext {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            block_states: IndexMap::new(),
            decisions: Decisions::default(),
            loop_iterations: IndexMap::new(),
            loop_items: IndexMap::new(),
            completed_loops: IndexSet::new(),
            loop_executions: None,
            parallel_executions: None,
            parallel_block_mapping: IndexMap::new(),
            executed_blocks: IndexSet::new(),
            active_execution_path: IndexSet::new(),
            environment_variables: IndexMap::new(),
            workflow_variables: IndexMap::new(),
            workflow_input,
            metadata: IndexMap::new(),
        }
    }

    pub fn with_environment(mut self, env: IndexMap<String, String>) -> Self {
        self.environment_variables = env;
        self
    }

    pub fn with_variables(mut self, vars: IndexMap<String, Value>) -> Self {
        self.workflow_variables = vars;
        self
    }

    /// Lazily-created loop tracking map.
    pub fn loop_executions_mut(&mut self) -> &mut IndexMap<String, LoopExecution> {
        self.loop_executions.get_or_insert_with(IndexMap::new)
    }

    /// Lazily-created parallel tracking map.
    pub fn parallel_executions_mut(&mut self) -> &mut IndexMap<String, ParallelExecution> {
        self.parallel_executions.get_or_insert_with(IndexMap::new)
    }

    pub fn record_success(&mut self, block_id: &str, output: Value, elapsed_ms: u64) {
        self.block_states
            .insert(block_id.to_string(), BlockState::success(output, elapsed_ms));
        self.executed_blocks.insert(block_id.to_string());
    }

    pub fn record_failure(&mut self, block_id: &str, message: String, elapsed_ms: u64) {
        self.block_states
            .insert(block_id.to_string(), BlockState::failure(message, elapsed_ms));
        self.executed_blocks.insert(block_id.to_string());
    }

    pub fn has_executed(&self, block_id: &str) -> bool {
        self.executed_blocks.contains(block_id)
    }

    /// Resolve a possibly-virtual block id back to its template id.
    pub fn template_id<'a>(&'a self, block_id: &'a str) -> &'a str {
        self.parallel_block_mapping
            .get(block_id)
            .map(String::as_str)
            .unwrap_or(block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_context_has_unique_execution_id() {
        let a = ExecutionContext::new("wf", None);
        let b = ExecutionContext::new("wf", None);
        assert_ne!(a.execution_id, b.execution_id);
        assert!(a.block_states.is_empty());
        assert!(a.loop_executions.is_none());
        assert!(a.parallel_executions.is_none());
    }

    #[test]
    fn test_record_success_and_failure() {
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.record_success("a", json!({"out": 1}), 5);
        ctx.record_failure("b", "boom".into(), 2);

        assert!(ctx.has_executed("a"));
        assert!(!ctx.block_states["a"].is_error());
        assert!(ctx.block_states["b"].is_error());
        assert_eq!(ctx.block_states["b"].output["error"], json!("boom"));
    }

    #[test]
    fn test_loop_execution_from_kind() {
        let fixed = LoopExecution::from_kind(LoopKind::Fixed(3));
        assert_eq!(fixed.max_iterations, 3);
        assert!(fixed.for_each_items.is_none());

        let items = vec![json!("x"), json!("y")];
        let fe = LoopExecution::from_kind(LoopKind::ForEach(items.clone()));
        assert_eq!(fe.max_iterations, 2);
        assert_eq!(fe.for_each_items, Some(items));
    }

    #[test]
    fn test_template_id_mapping() {
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.parallel_block_mapping
            .insert("child_parallel_p1_branch_0".into(), "child".into());
        assert_eq!(ctx.template_id("child_parallel_p1_branch_0"), "child");
        assert_eq!(ctx.template_id("child"), "child");
    }
}
