use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of block capabilities. Loop and parallel are structurally
/// special: their bodies are nested subgraphs identified by `parent_id` on
/// child blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Entry point of the workflow. Exactly one per graph.
    Starter,
    /// A unit of work dispatched through the executor registry by `block_type`.
    Action,
    /// Multi-output block choosing one downstream target by configuration.
    Router,
    /// Multi-output block choosing an outcome handle by evaluating conditions.
    Condition,
    /// Container re-entering its child subgraph once per iteration.
    Loop,
    /// Container fanning its child subgraph out across concurrent branches.
    Parallel,
}

/// A typed, configurable unit of work in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    /// Human label; also usable as a reference token source.
    pub name: String,
    /// Registry key for `Action` blocks ("agent", "function", ...). For
    /// structural kinds this mirrors the kind tag.
    pub block_type: String,
    /// Configuration inputs; values may contain reference tokens resolved at
    /// run time.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Set on blocks nested inside a loop/parallel container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Edge labels distinguishing the outputs of multi-output blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    Success,
    Error,
    LoopStart,
    LoopEnd,
    ParallelStart,
    ParallelEnd,
    /// Router target / condition outcome handle.
    Route(String),
}

impl EdgeLabel {
    /// Parse an edge label from an optional handle string.
    pub fn from_handle(handle: &Option<String>) -> Option<Self> {
        match handle.as_deref() {
            None => None,
            Some("success") => Some(EdgeLabel::Success),
            Some("error") => Some(EdgeLabel::Error),
            Some("loop-start") => Some(EdgeLabel::LoopStart),
            Some("loop-end") => Some(EdgeLabel::LoopEnd),
            Some("parallel-start") => Some(EdgeLabel::ParallelStart),
            Some("parallel-end") => Some(EdgeLabel::ParallelEnd),
            Some(other) => Some(EdgeLabel::Route(other.to_string())),
        }
    }
}

/// A directed, optionally labeled connection between two blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

/// Iteration policy for a loop container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum LoopKind {
    /// Re-enter the body a fixed number of times.
    Fixed(u32),
    /// Re-enter once per collection item, publishing the current item.
    ForEach(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub kind: LoopKind,
}

impl LoopConfig {
    pub fn max_iterations(&self) -> u32 {
        match &self.kind {
            LoopKind::Fixed(n) => *n,
            LoopKind::ForEach(items) => items.len() as u32,
        }
    }
}

/// Fan-out policy for a parallel container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ParallelKind {
    Fixed(u32),
    ForEach(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub kind: ParallelKind,
}

impl ParallelConfig {
    pub fn branch_count(&self) -> u32 {
        match &self.kind {
            ParallelKind::Fixed(n) => *n,
            ParallelKind::ForEach(items) => items.len() as u32,
        }
    }

    pub fn item_for(&self, index: u32) -> Option<Value> {
        match &self.kind {
            ParallelKind::Fixed(_) => None,
            ParallelKind::ForEach(items) => items.get(index as usize).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_label_from_handle() {
        assert_eq!(EdgeLabel::from_handle(&None), None);
        assert_eq!(
            EdgeLabel::from_handle(&Some("success".into())),
            Some(EdgeLabel::Success)
        );
        assert_eq!(
            EdgeLabel::from_handle(&Some("loop-end".into())),
            Some(EdgeLabel::LoopEnd)
        );
        assert_eq!(
            EdgeLabel::from_handle(&Some("route-2".into())),
            Some(EdgeLabel::Route("route-2".into()))
        );
    }

    #[test]
    fn test_loop_config_max_iterations() {
        let fixed = LoopConfig {
            kind: LoopKind::Fixed(5),
        };
        assert_eq!(fixed.max_iterations(), 5);

        let for_each = LoopConfig {
            kind: LoopKind::ForEach(vec![serde_json::json!(1), serde_json::json!(2)]),
        };
        assert_eq!(for_each.max_iterations(), 2);
    }

    #[test]
    fn test_parallel_config_items() {
        let cfg = ParallelConfig {
            kind: ParallelKind::ForEach(vec![serde_json::json!("a"), serde_json::json!("b")]),
        };
        assert_eq!(cfg.branch_count(), 2);
        assert_eq!(cfg.item_for(1), Some(serde_json::json!("b")));
        assert_eq!(cfg.item_for(2), None);
    }
}
