//! Dependency-graph executor
//!
//! A node starts once every dependency has succeeded and its details have
//! been merged into the shared context. Ready nodes run concurrently up to
//! the parallelism bound. A failure skips everything downstream of it while
//! unrelated branches keep going.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use super::{event_channel, ExecutionEvent};
use crate::capability::{
    merge_details, overlay_arguments, CapabilityRegistry, Context, ResultStatus, StepResult,
};
use crate::error::{EngineError, Result};
use crate::planning::WorkflowNode;

pub const DEFAULT_MAX_PARALLELISM: usize = 4;

/// A validated, acyclic workflow
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<WorkflowNode>,
    /// Indices of the nodes that depend on each node
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl WorkflowGraph {
    /// Validate ids, dependency references and acyclicity
    pub fn build(nodes: Vec<WorkflowNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(EngineError::invalid_plan(format!(
                    "duplicate workflow node id '{}'",
                    node.id
                )));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dependency in &node.dependencies {
                let &d = index.get(dependency).ok_or_else(|| {
                    EngineError::invalid_plan(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dependency
                    ))
                })?;
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm
        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut remaining = in_degree.clone();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if order.len() < nodes.len() {
            let cyclic: Vec<&str> = (0..nodes.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| nodes[i].id.as_str())
                .collect();
            return Err(EngineError::invalid_plan(format!(
                "workflow contains a cycle through: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self {
            nodes,
            dependents,
            order,
        })
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }
}

/// Result of one node, tagged with its id
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node_id: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub workflow_id: String,
    /// In completion order, skip markers included
    pub results: Vec<NodeOutcome>,
    pub context: Context,
}

impl WorkflowReport {
    pub fn outcome(&self, node_id: &str) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|outcome| outcome.node_id == node_id)
            .map(|outcome| &outcome.result)
    }

    pub fn completion_order(&self) -> Vec<&str> {
        self.results.iter().map(|o| o.node_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

pub struct GraphExecutor {
    registry: Arc<CapabilityRegistry>,
    max_parallelism: usize,
    auto_approve: bool,
    events: broadcast::Sender<ExecutionEvent>,
}

impl GraphExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            auto_approve: false,
            events: event_channel(),
        }
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Workflows cannot suspend, so approval-gated capabilities only run
    /// when approval is granted up front
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<ExecutionEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub async fn execute(
        &self,
        workflow_id: &str,
        graph: &WorkflowGraph,
        context: Context,
        cancel: &CancellationToken,
    ) -> Result<WorkflowReport> {
        let nodes = graph.nodes();
        let shared = Arc::new(RwLock::new(context));
        let mut states = vec![NodeState::Waiting; nodes.len()];
        let mut pending: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut results = Vec::with_capacity(nodes.len());
        let mut in_flight = FuturesUnordered::new();

        tracing::info!(workflow_id, nodes = nodes.len(), "workflow started");
        self.emit(ExecutionEvent::Started {
            execution_id: workflow_id.to_string(),
            steps: nodes.len(),
        });

        loop {
            while in_flight.len() < self.max_parallelism {
                let Some(i) = ready.pop_front() else { break };
                states[i] = NodeState::Running;
                tracing::debug!(workflow_id, node_id = %nodes[i].id, "dispatching node");
                in_flight.push(run_node(
                    self.registry.clone(),
                    shared.clone(),
                    i,
                    nodes[i].clone(),
                    self.auto_approve,
                ));
            }

            if in_flight.is_empty() {
                break;
            }

            let next = tokio::select! {
                biased;
                // Returning drops the in-flight futures, which interrupts them
                _ = cancel.cancelled() => {
                    tracing::info!(workflow_id, "workflow cancelled");
                    self.emit(ExecutionEvent::Cancelled {
                        execution_id: workflow_id.to_string(),
                    });
                    return Err(EngineError::Cancelled(workflow_id.to_string()));
                }
                next = in_flight.next() => next,
            };
            let Some((i, result)) = next else { break };
            let node = &nodes[i];

            if result.is_success() {
                // Merge before releasing dependents
                merge_details(&mut *shared.write().await, &result.details);
                states[i] = NodeState::Succeeded;
                for &d in &graph.dependents[i] {
                    pending[d] -= 1;
                    if pending[d] == 0 && states[d] == NodeState::Waiting {
                        ready.push_back(d);
                    }
                }
            } else {
                states[i] = NodeState::Failed;
                tracing::warn!(workflow_id, node_id = %node.id, summary = %result.summary, "node failed");
            }

            self.emit(ExecutionEvent::NodeCompleted {
                execution_id: workflow_id.to_string(),
                node_id: node.id.clone(),
                result: result.clone(),
            });
            results.push(NodeOutcome {
                node_id: node.id.clone(),
                result,
            });

            if states[i] == NodeState::Failed {
                results.extend(self.skip_dependents(workflow_id, graph, i, &mut states));
            }
        }

        let context = shared.read().await.clone();
        tracing::info!(workflow_id, results = results.len(), "workflow finished");
        self.emit(ExecutionEvent::Completed {
            execution_id: workflow_id.to_string(),
        });

        Ok(WorkflowReport {
            workflow_id: workflow_id.to_string(),
            results,
            context,
        })
    }

    /// Mark every transitive dependent of `failed` as skipped
    fn skip_dependents(
        &self,
        workflow_id: &str,
        graph: &WorkflowGraph,
        failed: usize,
        states: &mut [NodeState],
    ) -> Vec<NodeOutcome> {
        let nodes = graph.nodes();
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        let mut worklist = vec![failed];

        while let Some(current) = worklist.pop() {
            for &d in &graph.dependents[current] {
                if states[d] != NodeState::Waiting || !seen.insert(d) {
                    continue;
                }
                states[d] = NodeState::Skipped;
                let node = &nodes[d];
                let cause = &nodes[current].id;

                tracing::debug!(workflow_id, node_id = %node.id, failed_dependency = %cause, "skipping node");
                self.emit(ExecutionEvent::NodeSkipped {
                    execution_id: workflow_id.to_string(),
                    node_id: node.id.clone(),
                    failed_dependency: cause.clone(),
                });
                skipped.push(NodeOutcome {
                    node_id: node.id.clone(),
                    result: StepResult::skipped(&node.agent_name, &node.id, cause),
                });
                worklist.push(d);
            }
        }

        skipped
    }

    fn emit(&self, event: ExecutionEvent) {
        let _ = self.events.send(event);
    }
}

async fn run_node(
    registry: Arc<CapabilityRegistry>,
    shared: Arc<RwLock<Context>>,
    index: usize,
    node: WorkflowNode,
    auto_approve: bool,
) -> (usize, StepResult) {
    let Some(capability) = registry.lookup(&node.agent_name) else {
        let message = EngineError::CapabilityNotFound(node.agent_name.clone()).to_string();
        return (index, StepResult::failure(&node.agent_name, message));
    };

    if capability.requires_approval() && !auto_approve {
        return (
            index,
            StepResult::failure(
                &node.agent_name,
                format!(
                    "'{}' requires approval; workflows run approval-gated capabilities only when approved up front",
                    node.agent_name
                ),
            ),
        );
    }

    let input = {
        let snapshot = shared.read().await;
        overlay_arguments(&snapshot, &node.arguments)
    };

    let result = match capability.execute(input).await {
        Ok(result) if result.is_success() => result,
        Ok(mut result) => {
            result.status = ResultStatus::Failure;
            result
        }
        Err(e) => StepResult::failure(
            &node.agent_name,
            EngineError::CapabilityFailure {
                agent: node.agent_name.clone(),
                message: format!("{:#}", e),
            }
            .to_string(),
        ),
    };
    (index, result)
}
