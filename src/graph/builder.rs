use indexmap::IndexMap;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

use super::types::*;

/// Serializable form of a workflow graph: what the builder consumes and what
/// the pause service persists as the graph snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub loops: IndexMap<String, LoopConfig>,
    #[serde(default)]
    pub parallels: IndexMap<String, ParallelConfig>,
}

/// Immutable workflow definition, validated on construction.
#[derive(Debug)]
pub struct Workflow {
    graph: StableDiGraph<Block, Edge>,
    index_map: IndexMap<String, NodeIndex>,
    starter_id: String,
    loops: IndexMap<String, LoopConfig>,
    parallels: IndexMap<String, ParallelConfig>,
    snapshot: WorkflowSnapshot,
}

impl Workflow {
    /// Build and validate a workflow from its serializable form.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Result<Self, WorkflowError> {
        let mut graph = StableDiGraph::<Block, Edge>::new();
        let mut index_map: IndexMap<String, NodeIndex> = IndexMap::new();

        for block in &snapshot.blocks {
            if index_map.contains_key(&block.id) {
                return Err(WorkflowError::GraphBuildError(format!(
                    "Duplicate block id: {}",
                    block.id
                )));
            }
            let idx = graph.add_node(block.clone());
            index_map.insert(block.id.clone(), idx);
        }

        for edge in &snapshot.edges {
            let source_idx = index_map.get(&edge.source).ok_or_else(|| {
                WorkflowError::GraphBuildError(format!("Source block not found: {}", edge.source))
            })?;
            let target_idx = index_map.get(&edge.target).ok_or_else(|| {
                WorkflowError::GraphBuildError(format!("Target block not found: {}", edge.target))
            })?;
            graph.add_edge(*source_idx, *target_idx, edge.clone());
        }

        let workflow = Workflow {
            graph,
            index_map,
            starter_id: String::new(),
            loops: snapshot.loops.clone(),
            parallels: snapshot.parallels.clone(),
            snapshot,
        };
        workflow.validated()
    }

    fn validated(mut self) -> Result<Self, WorkflowError> {
        let starters: Vec<&Block> = self
            .blocks()
            .filter(|b| b.kind == BlockKind::Starter)
            .collect();
        let starter_id = match starters.as_slice() {
            [] => return Err(WorkflowError::NoStarterBlock),
            [only] => only.id.clone(),
            _ => return Err(WorkflowError::MultipleStarterBlocks),
        };

        for block in self.blocks() {
            if block.kind != BlockKind::Starter && self.incoming_edges(&block.id).next().is_none() {
                return Err(WorkflowError::GraphValidationError(format!(
                    "Block {} has no inbound edge",
                    block.id
                )));
            }

            if let Some(parent) = &block.parent_id {
                let is_container =
                    self.loops.contains_key(parent) || self.parallels.contains_key(parent);
                if !is_container {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Block {} references unknown container {}",
                        block.id, parent
                    )));
                }
                // Container bodies are flat subgraphs; containers do not nest.
                if matches!(block.kind, BlockKind::Loop | BlockKind::Parallel) {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Container {} cannot be nested inside {}",
                        block.id, parent
                    )));
                }
            }

            match block.kind {
                BlockKind::Loop if !self.loops.contains_key(&block.id) => {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Loop block {} has no iteration policy",
                        block.id
                    )));
                }
                BlockKind::Parallel if !self.parallels.contains_key(&block.id) => {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Parallel block {} has no fan-out policy",
                        block.id
                    )));
                }
                _ => {}
            }
        }

        for container_id in self.loops.keys().chain(self.parallels.keys()) {
            match self.block(container_id) {
                Some(b) if matches!(b.kind, BlockKind::Loop | BlockKind::Parallel) => {}
                _ => {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Container policy for {} does not match a loop/parallel block",
                        container_id
                    )));
                }
            }
        }

        self.starter_id = starter_id;
        Ok(self)
    }

    pub fn block(&self, block_id: &str) -> Option<&Block> {
        self.index_map
            .get(block_id)
            .and_then(|idx| self.graph.node_weight(*idx))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.graph.node_weights()
    }

    pub fn starter(&self) -> &Block {
        self.block(&self.starter_id)
            .expect("starter id validated at build time")
    }

    pub fn starter_id(&self) -> &str {
        &self.starter_id
    }

    pub fn outgoing_edges(&self, block_id: &str) -> impl Iterator<Item = &Edge> {
        self.index_map
            .get(block_id)
            .into_iter()
            .flat_map(move |idx| {
                self.graph
                    .edges_directed(*idx, petgraph::Direction::Outgoing)
                    .map(|e| e.weight())
            })
    }

    pub fn incoming_edges(&self, block_id: &str) -> impl Iterator<Item = &Edge> {
        self.index_map
            .get(block_id)
            .into_iter()
            .flat_map(move |idx| {
                self.graph
                    .edges_directed(*idx, petgraph::Direction::Incoming)
                    .map(|e| e.weight())
            })
    }

    /// Child blocks of a loop/parallel container, in definition order.
    pub fn children_of(&self, container_id: &str) -> Vec<&Block> {
        self.blocks()
            .filter(|b| b.parent_id.as_deref() == Some(container_id))
            .collect()
    }

    /// The target of this container's edge labeled with `label`, if any.
    pub fn labeled_target(&self, block_id: &str, label: &EdgeLabel) -> Option<&str> {
        self.outgoing_edges(block_id)
            .find(|e| e.label.as_ref() == Some(label))
            .map(|e| e.target.as_str())
    }

    pub fn loop_config(&self, container_id: &str) -> Option<&LoopConfig> {
        self.loops.get(container_id)
    }

    pub fn parallel_config(&self, container_id: &str) -> Option<&ParallelConfig> {
        self.parallels.get(container_id)
    }

    /// The serializable form this workflow was built from.
    pub fn snapshot(&self) -> &WorkflowSnapshot {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(id: &str, kind: BlockKind) -> Block {
        Block {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            block_type: format!("{:?}", kind).to_lowercase(),
            inputs: IndexMap::new(),
            parent_id: None,
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
            label: None,
        }
    }

    fn simple_snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            blocks: vec![block("start", BlockKind::Starter), block("a", BlockKind::Action)],
            edges: vec![edge("start", "a")],
            loops: IndexMap::new(),
            parallels: IndexMap::new(),
        }
    }

    #[test]
    fn test_build_simple_workflow() {
        let wf = Workflow::from_snapshot(simple_snapshot()).unwrap();
        assert_eq!(wf.starter_id(), "start");
        assert_eq!(wf.outgoing_edges("start").count(), 1);
        assert_eq!(wf.incoming_edges("a").count(), 1);
    }

    #[test]
    fn test_snapshot_preserved_and_comparable() {
        let snapshot = simple_snapshot();
        let wf = Workflow::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(wf.snapshot(), &snapshot);
    }

    #[test]
    fn test_missing_starter_rejected() {
        let snapshot = WorkflowSnapshot {
            blocks: vec![block("a", BlockKind::Action)],
            edges: vec![],
            loops: IndexMap::new(),
            parallels: IndexMap::new(),
        };
        assert!(matches!(
            Workflow::from_snapshot(snapshot),
            Err(WorkflowError::NoStarterBlock)
        ));
    }

    #[test]
    fn test_orphan_block_rejected() {
        let snapshot = WorkflowSnapshot {
            blocks: vec![block("start", BlockKind::Starter), block("a", BlockKind::Action)],
            edges: vec![],
            loops: IndexMap::new(),
            parallels: IndexMap::new(),
        };
        assert!(matches!(
            Workflow::from_snapshot(snapshot),
            Err(WorkflowError::GraphValidationError(_))
        ));
    }

    #[test]
    fn test_loop_without_policy_rejected() {
        let snapshot = WorkflowSnapshot {
            blocks: vec![
                block("start", BlockKind::Starter),
                block("loop1", BlockKind::Loop),
            ],
            edges: vec![edge("start", "loop1")],
            loops: IndexMap::new(),
            parallels: IndexMap::new(),
        };
        assert!(matches!(
            Workflow::from_snapshot(snapshot),
            Err(WorkflowError::GraphValidationError(_))
        ));
    }

    #[test]
    fn test_nested_container_rejected() {
        let mut inner = block("inner", BlockKind::Loop);
        inner.parent_id = Some("outer".to_string());

        let mut loops = IndexMap::new();
        for id in ["outer", "inner"] {
            loops.insert(
                id.to_string(),
                LoopConfig {
                    kind: LoopKind::Fixed(1),
                },
            );
        }

        let snapshot = WorkflowSnapshot {
            blocks: vec![
                block("start", BlockKind::Starter),
                block("outer", BlockKind::Loop),
                inner,
            ],
            edges: vec![
                edge("start", "outer"),
                Edge {
                    source: "outer".into(),
                    target: "inner".into(),
                    label: Some(EdgeLabel::LoopStart),
                },
            ],
            loops,
            parallels: IndexMap::new(),
        };
        assert!(matches!(
            Workflow::from_snapshot(snapshot),
            Err(WorkflowError::GraphValidationError(_))
        ));
    }

    #[test]
    fn test_container_children_and_labels() {
        let mut child = block("body", BlockKind::Action);
        child.parent_id = Some("loop1".to_string());

        let mut loops = IndexMap::new();
        loops.insert(
            "loop1".to_string(),
            LoopConfig {
                kind: LoopKind::ForEach(vec![json!(1), json!(2)]),
            },
        );

        let snapshot = WorkflowSnapshot {
            blocks: vec![
                block("start", BlockKind::Starter),
                block("loop1", BlockKind::Loop),
                child,
                block("after", BlockKind::Action),
            ],
            edges: vec![
                edge("start", "loop1"),
                Edge {
                    source: "loop1".into(),
                    target: "body".into(),
                    label: Some(EdgeLabel::LoopStart),
                },
                Edge {
                    source: "loop1".into(),
                    target: "after".into(),
                    label: Some(EdgeLabel::LoopEnd),
                },
            ],
            loops,
            parallels: IndexMap::new(),
        };

        let wf = Workflow::from_snapshot(snapshot).unwrap();
        assert_eq!(wf.children_of("loop1").len(), 1);
        assert_eq!(wf.labeled_target("loop1", &EdgeLabel::LoopStart), Some("body"));
        assert_eq!(wf.labeled_target("loop1", &EdgeLabel::LoopEnd), Some("after"));
        assert_eq!(wf.loop_config("loop1").unwrap().max_iterations(), 2);
    }
}
