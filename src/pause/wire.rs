//! Serialized form of a paused execution context.
//!
//! The in-memory context uses insertion-ordered maps that have no stable
//! serde representation guarantee across versions, so the durable format is
//! an explicit mirror: every map becomes a `Vec` of pairs whose order is the
//! map's insertion order. Deserializing rebuilds the maps pair by pair, which
//! makes ordering round-trip exact. Unknown fields are rejected so a record
//! written by a newer incompatible format fails loudly instead of silently
//! dropping state.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{
    BlockState, Decisions, ExecutionContext, LoopExecution, ParallelExecution,
};
use crate::graph::{LoopKind, ParallelKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedBlockState {
    pub output: Value,
    pub executed: bool,
    pub execution_time_ms: u64,
}

impl From<&BlockState> for SerializedBlockState {
    fn from(state: &BlockState) -> Self {
        SerializedBlockState {
            output: state.output.clone(),
            executed: state.executed,
            execution_time_ms: state.execution_time_ms,
        }
    }
}

impl From<SerializedBlockState> for BlockState {
    fn from(state: SerializedBlockState) -> Self {
        BlockState {
            output: state.output,
            executed: state.executed,
            execution_time_ms: state.execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedLoopExecution {
    pub max_iterations: u32,
    pub kind: LoopKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Vec<Value>>,
    /// Iteration index → aggregate result, in iteration order.
    pub execution_results: Vec<(u32, Value)>,
    pub current_iteration: u32,
}

impl From<&LoopExecution> for SerializedLoopExecution {
    fn from(exec: &LoopExecution) -> Self {
        SerializedLoopExecution {
            max_iterations: exec.max_iterations,
            kind: exec.kind.clone(),
            for_each_items: exec.for_each_items.clone(),
            execution_results: exec
                .execution_results
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            current_iteration: exec.current_iteration,
        }
    }
}

impl From<SerializedLoopExecution> for LoopExecution {
    fn from(exec: SerializedLoopExecution) -> Self {
        LoopExecution {
            max_iterations: exec.max_iterations,
            kind: exec.kind,
            for_each_items: exec.for_each_items,
            execution_results: exec.execution_results.into_iter().collect(),
            current_iteration: exec.current_iteration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedParallelExecution {
    pub parallel_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_items: Option<Vec<Value>>,
    pub completed_executions: u32,
    pub execution_results: Vec<(u32, Value)>,
    pub active_iterations: Vec<u32>,
    pub current_iteration: u32,
    pub kind: ParallelKind,
}

impl From<&ParallelExecution> for SerializedParallelExecution {
    fn from(exec: &ParallelExecution) -> Self {
        SerializedParallelExecution {
            parallel_count: exec.parallel_count,
            distribution_items: exec.distribution_items.clone(),
            completed_executions: exec.completed_executions,
            execution_results: exec
                .execution_results
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            active_iterations: exec.active_iterations.iter().copied().collect(),
            current_iteration: exec.current_iteration,
            kind: exec.kind.clone(),
        }
    }
}

impl From<SerializedParallelExecution> for ParallelExecution {
    fn from(exec: SerializedParallelExecution) -> Self {
        ParallelExecution {
            parallel_count: exec.parallel_count,
            distribution_items: exec.distribution_items,
            completed_executions: exec.completed_executions,
            execution_results: exec.execution_results.into_iter().collect(),
            active_iterations: exec.active_iterations.into_iter().collect(),
            current_iteration: exec.current_iteration,
            kind: exec.kind,
        }
    }
}

/// Durable mirror of [`ExecutionContext`]. Map fields serialize as ordered
/// pair vectors; `loop_executions`/`parallel_executions` stay `Option` so a
/// workflow without containers round-trips as absent rather than empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedContext {
    pub workflow_id: String,
    pub execution_id: String,

    pub block_states: Vec<(String, SerializedBlockState)>,
    pub router_decisions: Vec<(String, String)>,
    pub condition_decisions: Vec<(String, String)>,

    pub loop_iterations: Vec<(String, u32)>,
    pub loop_items: Vec<(String, Value)>,
    pub completed_loops: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_executions: Option<Vec<(String, SerializedLoopExecution)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_executions: Option<Vec<(String, SerializedParallelExecution)>>,
    pub parallel_block_mapping: Vec<(String, String)>,

    pub executed_blocks: Vec<String>,
    pub active_execution_path: Vec<String>,

    pub environment_variables: Vec<(String, String)>,
    pub workflow_variables: Vec<(String, Value)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_input: Option<Value>,
    pub metadata: Vec<(String, Value)>,
}

impl From<&ExecutionContext> for SerializedContext {
    fn from(ctx: &ExecutionContext) -> Self {
        SerializedContext {
            workflow_id: ctx.workflow_id.clone(),
            execution_id: ctx.execution_id.clone(),
            block_states: ctx
                .block_states
                .iter()
                .map(|(k, v)| (k.clone(), SerializedBlockState::from(v)))
                .collect(),
            router_decisions: pairs(&ctx.decisions.router),
            condition_decisions: pairs(&ctx.decisions.condition),
            loop_iterations: ctx
                .loop_iterations
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            loop_items: pairs(&ctx.loop_items),
            completed_loops: ctx.completed_loops.iter().cloned().collect(),
            loop_executions: ctx.loop_executions.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), SerializedLoopExecution::from(v)))
                    .collect()
            }),
            parallel_executions: ctx.parallel_executions.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), SerializedParallelExecution::from(v)))
                    .collect()
            }),
            parallel_block_mapping: pairs(&ctx.parallel_block_mapping),
            executed_blocks: ctx.executed_blocks.iter().cloned().collect(),
            active_execution_path: ctx.active_execution_path.iter().cloned().collect(),
            environment_variables: pairs(&ctx.environment_variables),
            workflow_variables: pairs(&ctx.workflow_variables),
            workflow_input: ctx.workflow_input.clone(),
            metadata: pairs(&ctx.metadata),
        }
    }
}

impl From<SerializedContext> for ExecutionContext {
    fn from(wire: SerializedContext) -> Self {
        ExecutionContext {
            workflow_id: wire.workflow_id,
            execution_id: wire.execution_id,
            block_states: wire
                .block_states
                .into_iter()
                .map(|(k, v)| (k, BlockState::from(v)))
                .collect(),
            decisions: Decisions {
                router: wire.router_decisions.into_iter().collect(),
                condition: wire.condition_decisions.into_iter().collect(),
            },
            loop_iterations: wire.loop_iterations.into_iter().collect(),
            loop_items: wire.loop_items.into_iter().collect(),
            completed_loops: wire.completed_loops.into_iter().collect(),
            loop_executions: wire.loop_executions.map(|v| {
                v.into_iter()
                    .map(|(k, e)| (k, LoopExecution::from(e)))
                    .collect()
            }),
            parallel_executions: wire.parallel_executions.map(|v| {
                v.into_iter()
                    .map(|(k, e)| (k, ParallelExecution::from(e)))
                    .collect()
            }),
            parallel_block_mapping: wire.parallel_block_mapping.into_iter().collect(),
            executed_blocks: wire.executed_blocks.into_iter().collect(),
            active_execution_path: wire.active_execution_path.into_iter().collect(),
            environment_variables: wire.environment_variables.into_iter().collect(),
            workflow_variables: wire.workflow_variables.into_iter().collect(),
            workflow_input: wire.workflow_input,
            metadata: wire.metadata.into_iter().collect(),
        }
    }
}

fn pairs<K: Clone, V: Clone>(map: &IndexMap<K, V>) -> Vec<(K, V)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_round_trip_preserves_order() {
        let mut ctx = ExecutionContext::new("wf", Some(json!({"n": 1})));
        ctx.record_success("z_last_alphabetically", json!({"v": 1}), 3);
        ctx.record_success("a_first_alphabetically", json!({"v": 2}), 4);
        ctx.decisions.router.insert("r".into(), "b".into());
        ctx.active_execution_path.insert("next".into());

        let wire = SerializedContext::from(&ctx);
        let json = serde_json::to_string(&wire).unwrap();
        let back: SerializedContext = serde_json::from_str(&json).unwrap();
        let restored = ExecutionContext::from(back);

        assert_eq!(restored, ctx);
        let keys: Vec<&String> = restored.block_states.keys().collect();
        assert_eq!(keys, vec!["z_last_alphabetically", "a_first_alphabetically"]);
    }

    #[test]
    fn test_absent_trackers_stay_absent() {
        let ctx = ExecutionContext::new("wf", None);
        let wire = SerializedContext::from(&ctx);
        let json = serde_json::to_string(&wire).unwrap();
        assert!(!json.contains("loop_executions"));
        assert!(!json.contains("parallel_executions"));

        let restored = ExecutionContext::from(serde_json::from_str::<SerializedContext>(&json).unwrap());
        assert!(restored.loop_executions.is_none());
        assert!(restored.parallel_executions.is_none());
    }

    #[test]
    fn test_empty_trackers_stay_empty() {
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.loop_executions_mut();

        let wire = SerializedContext::from(&ctx);
        let json = serde_json::to_string(&wire).unwrap();
        let restored = ExecutionContext::from(serde_json::from_str::<SerializedContext>(&json).unwrap());
        assert_eq!(restored.loop_executions, Some(IndexMap::new()));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let ctx = ExecutionContext::new("wf", None);
        let mut value = serde_json::to_value(SerializedContext::from(&ctx)).unwrap();
        value["surprise"] = json!(true);
        assert!(serde_json::from_value::<SerializedContext>(value).is_err());
    }

    #[test]
    fn test_loop_execution_round_trip() {
        let mut exec = LoopExecution::from_kind(LoopKind::ForEach(vec![json!("a"), json!("b")]));
        exec.execution_results.insert(0, json!({"body": "done"}));
        exec.current_iteration = 1;

        let wire = SerializedLoopExecution::from(&exec);
        let back = LoopExecution::from(wire);
        assert_eq!(back, exec);
    }
}
