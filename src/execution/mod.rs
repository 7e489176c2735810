//! Plan and workflow execution
//!
//! [`SequentialExecutor`] drives persisted ordered plans through approval
//! gates and remediation. [`GraphExecutor`] runs dependency graphs with
//! bounded parallelism. [`Engine`] ties both to a store, a planner and the
//! live-execution table, and is what callers talk to.

pub mod engine;
pub mod graph;
pub mod live;
pub mod sequential;

pub use engine::{Engine, EngineBuilder};
pub use graph::{GraphExecutor, NodeOutcome, WorkflowGraph, WorkflowReport};
pub use live::{LiveExecutions, LiveHandle};
pub use sequential::{Resumption, SequentialExecutor};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::capability::{Context, StepResult};
use crate::persistence::{ExecutionState, ExecutionStatus};

/// Buffered events per subscriber before the oldest are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status transitions broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        execution_id: String,
        steps: usize,
    },
    StepStarted {
        execution_id: String,
        step_index: usize,
        agent: String,
    },
    StepCompleted {
        execution_id: String,
        step_index: usize,
        result: StepResult,
    },
    ApprovalRequired {
        execution_id: String,
        step_index: usize,
        agent: String,
    },
    RemediationApplied {
        execution_id: String,
        step_index: usize,
        agent: String,
        attempt: u32,
        justification: String,
    },
    NodeCompleted {
        execution_id: String,
        node_id: String,
        result: StepResult,
    },
    NodeSkipped {
        execution_id: String,
        node_id: String,
        failed_dependency: String,
    },
    Completed {
        execution_id: String,
    },
    Failed {
        execution_id: String,
        reason: String,
    },
    Cancelled {
        execution_id: String,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::ApprovalRequired { execution_id, .. }
            | ExecutionEvent::RemediationApplied { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeSkipped { execution_id, .. }
            | ExecutionEvent::Completed { execution_id }
            | ExecutionEvent::Failed { execution_id, .. }
            | ExecutionEvent::Cancelled { execution_id } => execution_id,
        }
    }
}

pub fn event_channel() -> broadcast::Sender<ExecutionEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// What a sequential run hands back to its caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Full history, including approval-gate markers
    pub results: Vec<StepResult>,
    pub context: Context,
    pub current_step_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ExecutionReport {
    /// Results produced by running capabilities
    pub fn real_results(&self) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|result| !result.status.is_marker())
            .collect()
    }
}

impl From<&ExecutionState> for ExecutionReport {
    fn from(state: &ExecutionState) -> Self {
        Self {
            execution_id: state.id.clone(),
            status: state.status,
            results: state.execution_history.clone(),
            context: state.accumulated_context.clone(),
            current_step_index: state.current_step_index,
            failure_reason: state.failure_reason.clone(),
        }
    }
}
