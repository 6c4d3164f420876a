//! The graph executor — drives a workflow run.
//!
//! Traversal is readiness-driven, not topologically pre-ordered: a block
//! executes once every inbound edge comes from a block that is either
//! executed or provably unreachable. Router and condition decisions prune
//! sibling subtrees out of the active execution path so they are never
//! executed and never fail with missing inputs. Loop containers re-enter
//! their child subgraph once per iteration, strictly sequentially; parallel
//! containers fan the child subgraph out across concurrent branch tasks that
//! operate on disjoint virtual-block-keyed state and are merged by a single
//! writer.

pub mod events;

pub use events::{EventEmitter, ExecutionEvent};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blocks::{BlockExecutorRegistry, BlockOutcome, BlockScope};
use crate::context::{BlockState, ExecutionContext, LoopExecution, ParallelExecution};
use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::{Block, BlockKind, Edge, EdgeLabel, Workflow};
use crate::resolver::{resolve_inputs, ResolveScope};

/// Configuration for the engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    pub max_steps: i32,
    pub max_execution_time_secs: u64,
    /// 0 means unbounded parallel branch concurrency.
    #[serde(default)]
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_steps: 500,
            max_execution_time_secs: 600,
            max_concurrency: 0,
        }
    }
}

/// Terminal summary of a completed run. Partial failure is surfaced here,
/// not thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Outputs of the terminal blocks, keyed by block id.
    pub output: Value,
    pub had_failures: bool,
    pub duration_ms: u64,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(RunSummary),
    /// The context is left exactly as it was at the suspension boundary so
    /// resume is a pure continuation.
    Suspended { block_id: String, reason: String },
    /// Cancellation is terminal; the context must be discarded, never
    /// persisted as a paused record.
    Cancelled,
}

enum StepResult {
    Continue,
    Suspended { block_id: String, reason: String },
    Cancelled,
}

struct StepBudget {
    steps: i32,
    started: Instant,
}

/// Drives a [`Workflow`] against an [`ExecutionContext`].
pub struct Executor {
    workflow: Arc<Workflow>,
    registry: Arc<BlockExecutorRegistry>,
    config: EngineConfig,
    emitter: EventEmitter,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(workflow: Arc<Workflow>, registry: Arc<BlockExecutorRegistry>) -> Self {
        Executor {
            workflow,
            registry,
            config: EngineConfig::default(),
            emitter: EventEmitter::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Token observed at every traversal step; cancel it to stop the run
    /// between two block executions.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the workflow to a terminal, suspended, or cancelled outcome. The
    /// context may be fresh or reconstructed from a paused record.
    pub async fn run(&self, ctx: &mut ExecutionContext) -> WorkflowResult<ExecutionOutcome> {
        let mut budget = StepBudget {
            steps: 0,
            started: Instant::now(),
        };
        let scope = BlockScope {
            workflow_input: ctx.workflow_input.clone(),
            environment: Arc::new(ctx.environment_variables.clone()),
        };

        ctx.active_execution_path
            .insert(self.workflow.starter_id().to_string());

        loop {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(ctx).await;
            }

            self.refresh_active_path(ctx);
            let ready = self.collect_ready(ctx);
            if ready.is_empty() {
                break;
            }

            for block_id in ready {
                if self.cancel.is_cancelled() {
                    return self.finish_cancelled(ctx).await;
                }
                self.check_limits(&mut budget)?;

                match self.execute_block(ctx, &block_id, &scope, &mut budget).await? {
                    StepResult::Continue => {}
                    StepResult::Suspended { block_id, reason } => {
                        debug!(block_id = %block_id, "run suspended");
                        self.emitter
                            .emit(ExecutionEvent::RunSuspended {
                                execution_id: ctx.execution_id.clone(),
                                block_id: block_id.clone(),
                                reason: reason.clone(),
                            })
                            .await;
                        return Ok(ExecutionOutcome::Suspended { block_id, reason });
                    }
                    StepResult::Cancelled => return self.finish_cancelled(ctx).await,
                }
            }
        }

        let had_failures = ctx.block_states.values().any(BlockState::is_error);
        let summary = RunSummary {
            output: self.final_output(ctx),
            had_failures,
            duration_ms: budget.started.elapsed().as_millis() as u64,
        };
        self.emitter
            .emit(ExecutionEvent::RunCompleted {
                execution_id: ctx.execution_id.clone(),
                had_failures,
            })
            .await;
        Ok(ExecutionOutcome::Completed(summary))
    }

    async fn finish_cancelled(&self, ctx: &ExecutionContext) -> WorkflowResult<ExecutionOutcome> {
        debug!(execution_id = %ctx.execution_id, "run cancelled");
        self.emitter
            .emit(ExecutionEvent::RunCancelled {
                execution_id: ctx.execution_id.clone(),
            })
            .await;
        Ok(ExecutionOutcome::Cancelled)
    }

    fn check_limits(&self, budget: &mut StepBudget) -> WorkflowResult<()> {
        budget.steps += 1;
        if budget.steps > self.config.max_steps {
            return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
        }
        if budget.started.elapsed().as_secs() > self.config.max_execution_time_secs {
            return Err(WorkflowError::ExecutionTimeout);
        }
        Ok(())
    }

    /// Extend the active path with the targets of every live edge out of an
    /// executed block. Recomputed each round so a resumed context (or an
    /// externally injected gate outcome) propagates without replaying.
    fn refresh_active_path(&self, ctx: &mut ExecutionContext) {
        let mut additions: Vec<String> = Vec::new();
        for block in self.workflow.blocks().filter(|b| b.parent_id.is_none()) {
            if !ctx.has_executed(&block.id) {
                continue;
            }
            for edge in self.workflow.outgoing_edges(&block.id) {
                if self.edge_live(edge, ctx) {
                    additions.push(edge.target.clone());
                }
            }
        }
        for target in additions {
            ctx.active_execution_path.insert(target);
        }
    }

    /// Whether this edge fires, given that its source has executed.
    fn edge_live(&self, edge: &Edge, ctx: &ExecutionContext) -> bool {
        let Some(source) = self.workflow.block(&edge.source) else {
            return false;
        };
        match source.kind {
            BlockKind::Router => {
                ctx.decisions.router.get(&edge.source) == Some(&edge.target)
            }
            BlockKind::Condition => {
                ctx.decisions.condition.get(&edge.source) == Some(&edge.target)
            }
            BlockKind::Loop => {
                ctx.completed_loops.contains(&edge.source)
                    && edge.label == Some(EdgeLabel::LoopEnd)
            }
            BlockKind::Parallel => edge.label == Some(EdgeLabel::ParallelEnd),
            BlockKind::Starter | BlockKind::Action => {
                let failed = ctx
                    .block_states
                    .get(&edge.source)
                    .map(BlockState::is_error)
                    .unwrap_or(false);
                if failed {
                    edge.label == Some(EdgeLabel::Error)
                } else {
                    edge.label != Some(EdgeLabel::Error)
                }
            }
        }
    }

    /// A block that is not executed, not on the active path, and whose every
    /// inbound route is dead can never run; its consumers treat those edges
    /// as satisfied instead of waiting forever.
    fn is_unreachable(
        &self,
        block_id: &str,
        ctx: &ExecutionContext,
        visited: &mut HashSet<String>,
    ) -> bool {
        if ctx.has_executed(block_id) || ctx.active_execution_path.contains(block_id) {
            return false;
        }
        if !visited.insert(block_id.to_string()) {
            return true;
        }
        for edge in self.workflow.incoming_edges(block_id) {
            if ctx.has_executed(&edge.source) {
                if self.edge_live(edge, ctx) {
                    return false;
                }
                continue;
            }
            if !self.is_unreachable(&edge.source, ctx, visited) {
                return false;
            }
        }
        true
    }

    fn is_ready(&self, block_id: &str, ctx: &ExecutionContext) -> bool {
        if !ctx.active_execution_path.contains(block_id) || ctx.has_executed(block_id) {
            return false;
        }
        self.workflow.incoming_edges(block_id).all(|edge| {
            ctx.has_executed(&edge.source)
                || self.is_unreachable(&edge.source, ctx, &mut HashSet::new())
        })
    }

    fn collect_ready(&self, ctx: &ExecutionContext) -> Vec<String> {
        self.workflow
            .blocks()
            .filter(|b| b.parent_id.is_none())
            .filter(|b| self.is_ready(&b.id, ctx))
            .map(|b| b.id.clone())
            .collect()
    }

    async fn execute_block(
        &self,
        ctx: &mut ExecutionContext,
        block_id: &str,
        scope: &BlockScope,
        budget: &mut StepBudget,
    ) -> WorkflowResult<StepResult> {
        let block = self
            .workflow
            .block(block_id)
            .ok_or_else(|| WorkflowError::BlockNotFound(block_id.to_string()))?
            .clone();

        match block.kind {
            BlockKind::Loop => self.execute_loop(ctx, &block, scope, budget).await,
            BlockKind::Parallel => self.execute_parallel(ctx, &block, scope).await,
            _ => {
                let resolve_scope = ResolveScope::default();
                self.execute_simple(ctx, &block, scope, &resolve_scope).await
            }
        }
    }

    /// Execute one non-container block, recording its state, decision, and
    /// failure in-band. Suspension propagates without recording any state.
    async fn execute_simple(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        scope: &BlockScope,
        resolve_scope: &ResolveScope<'_>,
    ) -> WorkflowResult<StepResult> {
        debug!(block_id = %block.id, block_type = %block.block_type, "executing block");
        self.emitter
            .emit(ExecutionEvent::BlockStarted {
                block_id: block.id.clone(),
                block_type: block.block_type.clone(),
            })
            .await;

        let started = Instant::now();
        let inputs = match resolve_inputs(block, &self.workflow, ctx, resolve_scope) {
            Ok(inputs) => inputs,
            Err(e) => {
                return self
                    .record_block_failure(ctx, &block.id, e.to_string(), started)
                    .await;
            }
        };

        let executor = self
            .registry
            .get(&block.block_type)
            .ok_or_else(|| WorkflowError::ExecutorNotFound(block.block_type.clone()))?;

        match executor.execute(&block.id, &inputs, scope).await {
            Err(e) => {
                self.record_block_failure(ctx, &block.id, e.to_string(), started)
                    .await
            }
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match result.outcome {
                    BlockOutcome::Suspend { reason } => Ok(StepResult::Suspended {
                        block_id: block.id.clone(),
                        reason,
                    }),
                    BlockOutcome::Branch(handle) => {
                        let target = self.record_branch_decision(ctx, block, &handle)?;
                        ctx.record_success(&block.id, result.output, elapsed_ms);
                        self.emitter
                            .emit(ExecutionEvent::BranchSelected {
                                block_id: block.id.clone(),
                                target,
                            })
                            .await;
                        self.emitter
                            .emit(ExecutionEvent::BlockCompleted {
                                block_id: block.id.clone(),
                                duration_ms: elapsed_ms,
                            })
                            .await;
                        Ok(StepResult::Continue)
                    }
                    BlockOutcome::Completed => {
                        ctx.record_success(&block.id, result.output, elapsed_ms);
                        self.emitter
                            .emit(ExecutionEvent::BlockCompleted {
                                block_id: block.id.clone(),
                                duration_ms: elapsed_ms,
                            })
                            .await;
                        Ok(StepResult::Continue)
                    }
                }
            }
        }
    }

    async fn record_block_failure(
        &self,
        ctx: &mut ExecutionContext,
        block_id: &str,
        message: String,
        started: Instant,
    ) -> WorkflowResult<StepResult> {
        warn!(block_id = %block_id, error = %message, "block failed");
        ctx.record_failure(block_id, message.clone(), started.elapsed().as_millis() as u64);
        self.emitter
            .emit(ExecutionEvent::BlockFailed {
                block_id: block_id.to_string(),
                error: message,
            })
            .await;
        Ok(StepResult::Continue)
    }

    /// Map a branch handle to the chosen next block and record the decision.
    /// Routers name the target block directly; conditions name an outcome
    /// handle matched against `Route`-labeled edges.
    fn record_branch_decision(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        handle: &str,
    ) -> WorkflowResult<String> {
        match block.kind {
            BlockKind::Router => {
                let valid = self
                    .workflow
                    .outgoing_edges(&block.id)
                    .any(|e| e.target == handle);
                if !valid {
                    return Err(WorkflowError::GraphValidationError(format!(
                        "Router {} chose target '{}' but no matching edge found",
                        block.id, handle
                    )));
                }
                ctx.decisions
                    .router
                    .insert(block.id.clone(), handle.to_string());
                Ok(handle.to_string())
            }
            BlockKind::Condition => {
                let target = self
                    .workflow
                    .labeled_target(&block.id, &EdgeLabel::Route(handle.to_string()))
                    .ok_or_else(|| {
                        WorkflowError::GraphValidationError(format!(
                            "Condition {} chose outcome '{}' but no matching edge found",
                            block.id, handle
                        ))
                    })?
                    .to_string();
                ctx.decisions
                    .condition
                    .insert(block.id.clone(), target.clone());
                Ok(target)
            }
            _ => Err(WorkflowError::InternalError(format!(
                "block {} returned a branch outcome but is not a router/condition",
                block.id
            ))),
        }
    }

    // ---- loop containers -------------------------------------------------

    async fn execute_loop(
        &self,
        ctx: &mut ExecutionContext,
        container: &Block,
        scope: &BlockScope,
        budget: &mut StepBudget,
    ) -> WorkflowResult<StepResult> {
        let config = self
            .workflow
            .loop_config(&container.id)
            .ok_or_else(|| {
                WorkflowError::GraphValidationError(format!(
                    "Loop {} has no iteration policy",
                    container.id
                ))
            })?
            .clone();

        let container_started = Instant::now();
        let has_tracker = ctx
            .loop_executions
            .as_ref()
            .is_some_and(|m| m.contains_key(&container.id));
        if !has_tracker {
            ctx.loop_executions_mut()
                .insert(container.id.clone(), LoopExecution::from_kind(config.kind.clone()));
            ctx.loop_iterations.insert(container.id.clone(), 0);
        }

        let child_ids: Vec<String> = self
            .workflow
            .children_of(&container.id)
            .iter()
            .map(|b| b.id.clone())
            .collect();
        let entries: Vec<String> = self
            .workflow
            .outgoing_edges(&container.id)
            .filter(|e| e.label == Some(EdgeLabel::LoopStart))
            .map(|e| e.target.clone())
            .collect();
        if entries.is_empty() {
            return Err(WorkflowError::GraphValidationError(format!(
                "Loop {} has no loop-start edge",
                container.id
            )));
        }

        loop {
            let iteration = ctx.loop_iterations.get(&container.id).copied().unwrap_or(0);
            let max = self.loop_tracker(ctx, &container.id)?.max_iterations;
            if iteration >= max {
                break;
            }
            if self.cancel.is_cancelled() {
                return Ok(StepResult::Cancelled);
            }

            if let Some(items) = self.loop_tracker(ctx, &container.id)?.for_each_items.clone() {
                let item = items
                    .get(iteration as usize)
                    .cloned()
                    .unwrap_or(Value::Null);
                ctx.loop_items.insert(container.id.clone(), item);
            }

            debug!(container_id = %container.id, iteration, "loop iteration");
            match self
                .run_loop_subgraph(ctx, container, &child_ids, &entries, scope, budget)
                .await?
            {
                StepResult::Continue => {}
                other => return Ok(other),
            }

            // Record this iteration's aggregate result, then reset child
            // state for the next pass.
            let mut iteration_result = serde_json::Map::new();
            for child in &child_ids {
                if ctx.has_executed(child) {
                    if let Some(state) = ctx.block_states.get(child) {
                        iteration_result.insert(child.clone(), state.output.clone());
                    }
                }
            }
            let tracker = self.loop_tracker_mut(ctx, &container.id)?;
            tracker
                .execution_results
                .insert(iteration, Value::Object(iteration_result));
            tracker.current_iteration = iteration + 1;
            ctx.loop_iterations.insert(container.id.clone(), iteration + 1);

            for child in &child_ids {
                ctx.executed_blocks.swap_remove(child);
                ctx.active_execution_path.swap_remove(child);
                ctx.decisions.router.swap_remove(child);
                ctx.decisions.condition.swap_remove(child);
            }

            self.emitter
                .emit(ExecutionEvent::LoopIterationCompleted {
                    container_id: container.id.clone(),
                    iteration,
                })
                .await;
        }

        let results: Vec<Value> = {
            let tracker = self.loop_tracker(ctx, &container.id)?;
            tracker.execution_results.values().cloned().collect()
        };
        ctx.completed_loops.insert(container.id.clone());
        ctx.loop_items.swap_remove(&container.id);
        ctx.record_success(
            &container.id,
            serde_json::json!({ "results": results }),
            container_started.elapsed().as_millis() as u64,
        );
        Ok(StepResult::Continue)
    }

    fn loop_tracker<'a>(
        &self,
        ctx: &'a ExecutionContext,
        container_id: &str,
    ) -> WorkflowResult<&'a LoopExecution> {
        ctx.loop_executions
            .as_ref()
            .and_then(|m| m.get(container_id))
            .ok_or_else(|| {
                WorkflowError::InternalError(format!("loop tracker missing for {}", container_id))
            })
    }

    fn loop_tracker_mut<'a>(
        &self,
        ctx: &'a mut ExecutionContext,
        container_id: &str,
    ) -> WorkflowResult<&'a mut LoopExecution> {
        ctx.loop_executions_mut().get_mut(container_id).ok_or_else(|| {
            WorkflowError::InternalError(format!("loop tracker missing for {}", container_id))
        })
    }

    /// Run one iteration of a loop body to quiescence. Operates directly on
    /// the shared context; loop iterations are strictly sequential because
    /// `loop_items`/`loop_iterations` are shared, non-branch-local state.
    async fn run_loop_subgraph(
        &self,
        ctx: &mut ExecutionContext,
        container: &Block,
        child_ids: &[String],
        entries: &[String],
        scope: &BlockScope,
        budget: &mut StepBudget,
    ) -> WorkflowResult<StepResult> {
        for entry in entries {
            ctx.active_execution_path.insert(entry.clone());
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(StepResult::Cancelled);
            }

            // Path propagation within the body.
            let mut additions = Vec::new();
            for child in child_ids {
                if !ctx.has_executed(child) {
                    continue;
                }
                for edge in self.workflow.outgoing_edges(child) {
                    if child_ids.contains(&edge.target) && self.edge_live(edge, ctx) {
                        additions.push(edge.target.clone());
                    }
                }
            }
            for target in additions {
                ctx.active_execution_path.insert(target);
            }

            let ready: Vec<String> = child_ids
                .iter()
                .filter(|id| self.child_is_ready(ctx, &container.id, child_ids, id))
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            for child_id in ready {
                self.check_limits(budget)?;
                let child = self
                    .workflow
                    .block(&child_id)
                    .ok_or_else(|| WorkflowError::BlockNotFound(child_id.clone()))?
                    .clone();
                let resolve_scope = ResolveScope {
                    loop_container: Some(&container.id),
                    ..Default::default()
                };
                match self.execute_simple(ctx, &child, scope, &resolve_scope).await? {
                    StepResult::Continue => {}
                    other => return Ok(other),
                }
            }
        }
        Ok(StepResult::Continue)
    }

    /// Readiness inside a container body: container-sourced edges are the
    /// iteration entry and count as fired; sibling edges follow the normal
    /// executed-or-unreachable rule.
    fn child_is_ready(
        &self,
        ctx: &ExecutionContext,
        container_id: &str,
        child_ids: &[String],
        block_id: &str,
    ) -> bool {
        if !ctx.active_execution_path.contains(block_id) || ctx.has_executed(block_id) {
            return false;
        }
        self.workflow.incoming_edges(block_id).all(|edge| {
            edge.source == container_id
                || ctx.has_executed(&edge.source)
                || self.child_is_unreachable(
                    ctx,
                    container_id,
                    child_ids,
                    &edge.source,
                    &mut HashSet::new(),
                )
        })
    }

    fn child_is_unreachable(
        &self,
        ctx: &ExecutionContext,
        container_id: &str,
        child_ids: &[String],
        block_id: &str,
        visited: &mut HashSet<String>,
    ) -> bool {
        if ctx.has_executed(block_id) || ctx.active_execution_path.contains(block_id) {
            return false;
        }
        if !child_ids.contains(&block_id.to_string()) {
            return true;
        }
        if !visited.insert(block_id.to_string()) {
            return true;
        }
        for edge in self.workflow.incoming_edges(block_id) {
            if edge.source == container_id {
                continue;
            }
            if ctx.has_executed(&edge.source) {
                if self.edge_live(edge, ctx) {
                    return false;
                }
                continue;
            }
            if !self.child_is_unreachable(ctx, container_id, child_ids, &edge.source, visited) {
                return false;
            }
        }
        true
    }

    // ---- parallel containers ---------------------------------------------

    async fn execute_parallel(
        &self,
        ctx: &mut ExecutionContext,
        container: &Block,
        scope: &BlockScope,
    ) -> WorkflowResult<StepResult> {
        let config = self
            .workflow
            .parallel_config(&container.id)
            .ok_or_else(|| {
                WorkflowError::GraphValidationError(format!(
                    "Parallel {} has no fan-out policy",
                    container.id
                ))
            })?
            .clone();

        let container_started = Instant::now();
        let has_tracker = ctx
            .parallel_executions
            .as_ref()
            .is_some_and(|m| m.contains_key(&container.id));
        if !has_tracker {
            ctx.parallel_executions_mut().insert(
                container.id.clone(),
                ParallelExecution::from_kind(config.kind.clone()),
            );
        }
        let count = self.parallel_tracker(ctx, &container.id)?.parallel_count;

        // One virtual id per (template child, branch index); branches execute
        // the same template subgraph under independent identities.
        let children: Vec<Block> = self
            .workflow
            .children_of(&container.id)
            .into_iter()
            .cloned()
            .collect();
        for index in 0..count {
            for child in &children {
                let vid = virtual_block_id(&child.id, &container.id, index);
                ctx.parallel_block_mapping.insert(vid, child.id.clone());
            }
        }

        let pending: Vec<u32> = {
            let tracker = self.parallel_tracker(ctx, &container.id)?;
            (0..count)
                .filter(|i| !tracker.execution_results.contains_key(i))
                .collect()
        };
        {
            let tracker = self.parallel_tracker_mut(ctx, &container.id)?;
            tracker.active_iterations = pending.iter().copied().collect();
            tracker.current_iteration = count;
        }

        let spawn_branch =
            |join_set: &mut JoinSet<WorkflowResult<BranchOutput>>, ctx: &ExecutionContext, index: u32| {
                let input = BranchInput {
                    workflow: Arc::clone(&self.workflow),
                    registry: Arc::clone(&self.registry),
                    base: ctx.clone(),
                    container_id: container.id.clone(),
                    index,
                    item: config.item_for(index),
                    scope: scope.clone(),
                    cancel: self.cancel.clone(),
                };
                join_set.spawn(run_parallel_branch(input));
            };

        let window = if self.config.max_concurrency == 0 {
            pending.len()
        } else {
            self.config.max_concurrency
        };
        let mut queue: std::collections::VecDeque<u32> = pending.into_iter().collect();
        let mut join_set: JoinSet<WorkflowResult<BranchOutput>> = JoinSet::new();
        while join_set.len() < window {
            match queue.pop_front() {
                Some(index) => spawn_branch(&mut join_set, ctx, index),
                None => break,
            }
        }

        let mut suspended: Option<(String, String)> = None;
        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            if !cancelled {
                if let Some(index) = queue.pop_front() {
                    spawn_branch(&mut join_set, ctx, index);
                }
            }
            let branch = joined
                .map_err(|e| WorkflowError::InternalError(format!("branch task failed: {}", e)))??;

            if branch.cancelled {
                cancelled = true;
                continue;
            }

            // Single-writer merge: branch-local state lands under virtual ids.
            for (template_id, state) in branch.states {
                let vid = virtual_block_id(&template_id, &container.id, branch.index);
                ctx.block_states.insert(vid.clone(), state);
                ctx.executed_blocks.insert(vid);
            }
            for (template_id, target, is_router) in branch.decisions {
                let vid = virtual_block_id(&template_id, &container.id, branch.index);
                if is_router {
                    ctx.decisions.router.insert(vid, target);
                } else {
                    ctx.decisions.condition.insert(vid, target);
                }
            }

            if let Some((template_id, reason)) = branch.suspended {
                let vid = virtual_block_id(&template_id, &container.id, branch.index);
                suspended = Some((vid, reason));
                continue;
            }

            let tracker = self.parallel_tracker_mut(ctx, &container.id)?;
            tracker.execution_results.insert(branch.index, branch.result);
            tracker.completed_executions += 1;
            tracker.active_iterations.swap_remove(&branch.index);
            self.emitter
                .emit(ExecutionEvent::ParallelBranchCompleted {
                    container_id: container.id.clone(),
                    branch_index: branch.index,
                })
                .await;
        }

        if cancelled {
            return Ok(StepResult::Cancelled);
        }
        if let Some((block_id, reason)) = suspended {
            return Ok(StepResult::Suspended { block_id, reason });
        }

        let tracker = self.parallel_tracker(ctx, &container.id)?;
        if tracker.completed_executions == count {
            let results: Vec<Value> = (0..count)
                .map(|i| tracker.execution_results.get(&i).cloned().unwrap_or(Value::Null))
                .collect();
            ctx.record_success(
                &container.id,
                serde_json::json!({ "results": results }),
                container_started.elapsed().as_millis() as u64,
            );
        }
        Ok(StepResult::Continue)
    }

    fn parallel_tracker<'a>(
        &self,
        ctx: &'a ExecutionContext,
        container_id: &str,
    ) -> WorkflowResult<&'a ParallelExecution> {
        ctx.parallel_executions
            .as_ref()
            .and_then(|m| m.get(container_id))
            .ok_or_else(|| {
                WorkflowError::InternalError(format!(
                    "parallel tracker missing for {}",
                    container_id
                ))
            })
    }

    fn parallel_tracker_mut<'a>(
        &self,
        ctx: &'a mut ExecutionContext,
        container_id: &str,
    ) -> WorkflowResult<&'a mut ParallelExecution> {
        ctx.parallel_executions_mut()
            .get_mut(container_id)
            .ok_or_else(|| {
                WorkflowError::InternalError(format!(
                    "parallel tracker missing for {}",
                    container_id
                ))
            })
    }

    /// Aggregate the outputs of terminal blocks: executed top-level blocks
    /// none of whose live edges reached another executed block.
    fn final_output(&self, ctx: &ExecutionContext) -> Value {
        let mut out = serde_json::Map::new();
        for block in self.workflow.blocks().filter(|b| b.parent_id.is_none()) {
            if !ctx.has_executed(&block.id) {
                continue;
            }
            let has_live_successor = self.workflow.outgoing_edges(&block.id).any(|e| {
                self.edge_live(e, ctx) && ctx.has_executed(&e.target)
            });
            if !has_live_successor {
                if let Some(state) = ctx.block_states.get(&block.id) {
                    out.insert(block.id.clone(), state.output.clone());
                }
            }
        }
        Value::Object(out)
    }
}

pub(crate) fn virtual_block_id(template_id: &str, container_id: &str, index: u32) -> String {
    format!("{}_parallel_{}_branch_{}", template_id, container_id, index)
}

// ---- parallel branch tasks ----------------------------------------------

struct BranchInput {
    workflow: Arc<Workflow>,
    registry: Arc<BlockExecutorRegistry>,
    /// Read-only snapshot of the outer context for reference resolution and
    /// resume seeding. Never written.
    base: ExecutionContext,
    container_id: String,
    index: u32,
    item: Option<Value>,
    scope: BlockScope,
    cancel: CancellationToken,
}

struct BranchOutput {
    index: u32,
    /// Branch-local states keyed by template id; renamed to virtual ids at
    /// merge time.
    states: IndexMap<String, BlockState>,
    decisions: Vec<(String, String, bool)>,
    result: Value,
    suspended: Option<(String, String)>,
    cancelled: bool,
}

/// Execute one parallel branch against branch-local state. Branches never
/// touch the shared context; the caller merges their output.
async fn run_parallel_branch(input: BranchInput) -> WorkflowResult<BranchOutput> {
    let BranchInput {
        workflow,
        registry,
        base,
        container_id,
        index,
        item,
        scope,
        cancel,
    } = input;

    let children: Vec<Block> = workflow
        .children_of(&container_id)
        .into_iter()
        .cloned()
        .collect();
    let child_ids: Vec<String> = children.iter().map(|b| b.id.clone()).collect();

    let mut states: IndexMap<String, BlockState> = IndexMap::new();
    let mut executed: IndexSet<String> = IndexSet::new();
    let mut router_decisions: IndexMap<String, String> = IndexMap::new();
    let mut condition_decisions: IndexMap<String, String> = IndexMap::new();
    let mut decision_log: Vec<(String, String, bool)> = Vec::new();

    // Resume seeding: state already merged under this branch's virtual ids
    // belongs to a previously suspended pass over this branch.
    for child in &children {
        let vid = virtual_block_id(&child.id, &container_id, index);
        if let Some(state) = base.block_states.get(&vid) {
            states.insert(child.id.clone(), state.clone());
            executed.insert(child.id.clone());
        }
        if let Some(target) = base.decisions.router.get(&vid) {
            router_decisions.insert(child.id.clone(), target.clone());
        }
        if let Some(target) = base.decisions.condition.get(&vid) {
            condition_decisions.insert(child.id.clone(), target.clone());
        }
    }

    let mut path: IndexSet<String> = workflow
        .outgoing_edges(&container_id)
        .filter(|e| e.label == Some(EdgeLabel::ParallelStart))
        .map(|e| e.target.clone())
        .collect();
    if path.is_empty() {
        return Err(WorkflowError::GraphValidationError(format!(
            "Parallel {} has no parallel-start edge",
            container_id
        )));
    }

    let edge_live_local = |edge: &Edge,
                           states: &IndexMap<String, BlockState>,
                           router: &IndexMap<String, String>,
                           condition: &IndexMap<String, String>|
     -> bool {
        let Some(source) = workflow.block(&edge.source) else {
            return false;
        };
        match source.kind {
            BlockKind::Router => router.get(&edge.source) == Some(&edge.target),
            BlockKind::Condition => condition.get(&edge.source) == Some(&edge.target),
            _ => {
                let failed = states
                    .get(&edge.source)
                    .map(BlockState::is_error)
                    .unwrap_or(false);
                if failed {
                    edge.label == Some(EdgeLabel::Error)
                } else {
                    edge.label != Some(EdgeLabel::Error)
                }
            }
        }
    };

    fn unreachable_local(
        workflow: &Workflow,
        container_id: &str,
        child_ids: &[String],
        block_id: &str,
        executed: &IndexSet<String>,
        path: &IndexSet<String>,
        live: &dyn Fn(&Edge) -> bool,
        visited: &mut HashSet<String>,
    ) -> bool {
        if executed.contains(block_id) || path.contains(block_id) {
            return false;
        }
        if !child_ids.contains(&block_id.to_string()) {
            return true;
        }
        if !visited.insert(block_id.to_string()) {
            return true;
        }
        for edge in workflow.incoming_edges(block_id) {
            if edge.source == container_id {
                continue;
            }
            if executed.contains(&edge.source) {
                if live(edge) {
                    return false;
                }
                continue;
            }
            if !unreachable_local(
                workflow,
                container_id,
                child_ids,
                &edge.source,
                executed,
                path,
                live,
                visited,
            ) {
                return false;
            }
        }
        true
    }

    let mut suspended: Option<(String, String)> = None;

    'outer: loop {
        if cancel.is_cancelled() {
            return Ok(BranchOutput {
                index,
                states,
                decisions: decision_log,
                result: Value::Null,
                suspended: None,
                cancelled: true,
            });
        }

        // Path propagation among children.
        let mut additions = Vec::new();
        for id in executed.iter() {
            for edge in workflow.outgoing_edges(id) {
                if child_ids.contains(&edge.target)
                    && edge_live_local(edge, &states, &router_decisions, &condition_decisions)
                {
                    additions.push(edge.target.clone());
                }
            }
        }
        for target in additions {
            path.insert(target);
        }

        let ready: Vec<Block> = children
            .iter()
            .filter(|b| path.contains(&b.id) && !executed.contains(&b.id))
            .filter(|b| {
                workflow.incoming_edges(&b.id).all(|edge| {
                    edge.source == container_id
                        || executed.contains(&edge.source)
                        || unreachable_local(
                            &workflow,
                            &container_id,
                            &child_ids,
                            &edge.source,
                            &executed,
                            &path,
                            &|e| {
                                edge_live_local(
                                    e,
                                    &states,
                                    &router_decisions,
                                    &condition_decisions,
                                )
                            },
                            &mut HashSet::new(),
                        )
                })
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            break;
        }

        for block in ready {
            let started = Instant::now();
            let resolved = {
                let resolve_scope = ResolveScope {
                    parallel_container: Some(&container_id),
                    parallel_index: Some(index),
                    parallel_item: item.as_ref(),
                    local_states: Some(&states),
                    ..Default::default()
                };
                resolve_inputs(&block, &workflow, &base, &resolve_scope)
            };
            let inputs = match resolved {
                Ok(inputs) => inputs,
                Err(e) => {
                    states.insert(
                        block.id.clone(),
                        BlockState::failure(e.to_string(), started.elapsed().as_millis() as u64),
                    );
                    executed.insert(block.id.clone());
                    continue;
                }
            };

            let executor = registry
                .get(&block.block_type)
                .ok_or_else(|| WorkflowError::ExecutorNotFound(block.block_type.clone()))?;

            match executor.execute(&block.id, &inputs, &scope).await {
                Err(e) => {
                    warn!(block_id = %block.id, branch = index, error = %e, "branch block failed");
                    states.insert(
                        block.id.clone(),
                        BlockState::failure(e.to_string(), started.elapsed().as_millis() as u64),
                    );
                    executed.insert(block.id.clone());
                }
                Ok(result) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    match result.outcome {
                        BlockOutcome::Suspend { reason } => {
                            suspended = Some((block.id.clone(), reason));
                            break 'outer;
                        }
                        BlockOutcome::Branch(handle) => {
                            match block.kind {
                                BlockKind::Router => {
                                    router_decisions
                                        .insert(block.id.clone(), handle.clone());
                                    decision_log.push((block.id.clone(), handle, true));
                                }
                                BlockKind::Condition => {
                                    let target = workflow
                                        .labeled_target(
                                            &block.id,
                                            &EdgeLabel::Route(handle.clone()),
                                        )
                                        .ok_or_else(|| {
                                            WorkflowError::GraphValidationError(format!(
                                                "Condition {} chose outcome '{}' but no matching edge found",
                                                block.id, handle
                                            ))
                                        })?
                                        .to_string();
                                    condition_decisions
                                        .insert(block.id.clone(), target.clone());
                                    decision_log.push((block.id.clone(), target, false));
                                }
                                _ => {
                                    return Err(WorkflowError::InternalError(format!(
                                        "block {} returned a branch outcome but is not a router/condition",
                                        block.id
                                    )));
                                }
                            }
                            states
                                .insert(block.id.clone(), BlockState::success(result.output, elapsed_ms));
                            executed.insert(block.id.clone());
                        }
                        BlockOutcome::Completed => {
                            states
                                .insert(block.id.clone(), BlockState::success(result.output, elapsed_ms));
                            executed.insert(block.id.clone());
                        }
                    }
                }
            }
        }
    }

    let mut result = serde_json::Map::new();
    for id in executed.iter() {
        if let Some(state) = states.get(id) {
            result.insert(id.clone(), state.output.clone());
        }
    }

    Ok(BranchOutput {
        index,
        states,
        decisions: decision_log,
        result: Value::Object(result),
        suspended,
        cancelled: false,
    })
}
