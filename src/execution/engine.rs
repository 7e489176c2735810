//! Control surface over both executors
//!
//! The engine owns the live-execution table. Every execution it starts or
//! resumes is registered there before its first in-flight save, which is
//! what lets the recovery sweep tell orphans from running work.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::graph::{GraphExecutor, WorkflowGraph, WorkflowReport};
use super::live::{LiveExecutions, LiveHandle};
use super::sequential::{Resumption, SequentialExecutor};
use super::{event_channel, ExecutionEvent, ExecutionReport};
use crate::capability::{CapabilityRegistry, Context};
use crate::config::ExecutionConfig;
use crate::error::{EngineError, Result};
use crate::llm::LlmClient;
use crate::persistence::{ExecutionState, ExecutionStatus, ExecutionStore, INTERRUPTED_REASON};
use crate::planning::{
    FailFastAdvisor, LlmRemediationAdvisor, PlanStep, Planner, RemediationAdvisor, WorkflowNode,
};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct EngineBuilder {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn ExecutionStore>,
    llm: Option<Arc<dyn LlmClient>>,
    advisor: Option<Arc<dyn RemediationAdvisor>>,
    config: ExecutionConfig,
    auto_approve_workflows: bool,
}

impl EngineBuilder {
    /// Reasoning backend for planning and, unless overridden, remediation
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn advisor(mut self, advisor: Arc<dyn RemediationAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn auto_approve_workflows(mut self, approve: bool) -> Self {
        self.auto_approve_workflows = approve;
        self
    }

    pub fn build(self) -> Engine {
        let events = event_channel();

        let advisor: Arc<dyn RemediationAdvisor> = match (self.advisor, &self.llm) {
            (Some(advisor), _) => advisor,
            (None, Some(llm)) => Arc::new(LlmRemediationAdvisor::new(llm.clone())),
            (None, None) => Arc::new(FailFastAdvisor),
        };
        let planner = self
            .llm
            .map(|llm| Arc::new(Planner::new(llm, self.registry.clone())));

        let sequential = SequentialExecutor::new(self.registry.clone(), self.store.clone(), advisor)
            .with_recovery_budget(self.config.recovery_budget)
            .with_events(events.clone());
        let graph = GraphExecutor::new(self.registry.clone())
            .with_max_parallelism(self.config.max_parallelism)
            .with_auto_approve(self.auto_approve_workflows)
            .with_events(events.clone());

        Engine {
            registry: self.registry,
            store: self.store,
            planner,
            sequential: Arc::new(sequential),
            graph,
            live: LiveExecutions::new(self.config.live_ttl()),
            events,
            config: self.config,
        }
    }
}

pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn ExecutionStore>,
    planner: Option<Arc<Planner>>,
    sequential: Arc<SequentialExecutor>,
    graph: GraphExecutor,
    live: LiveExecutions,
    events: broadcast::Sender<ExecutionEvent>,
    config: ExecutionConfig,
}

impl Engine {
    pub fn builder(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn ExecutionStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            registry,
            store,
            llm: None,
            advisor: None,
            config: ExecutionConfig::default(),
            auto_approve_workflows: false,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn is_live(&self, execution_id: &str) -> bool {
        self.live.is_live(execution_id)
    }

    /// Fail every in-flight record that no task in this process owns
    pub async fn recover(&self) -> Result<Vec<String>> {
        let purged = self.live.purge_expired();
        if purged > 0 {
            tracing::warn!(purged, "expired live executions purged");
        }

        let recovered = self
            .store
            .recover_interrupted(&|id: &str| self.live.is_live(id))
            .await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "interrupted executions marked failed");
        }
        Ok(recovered)
    }

    /// Run the recovery sweep every `sweep_interval` until the engine is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(strong) = engine.upgrade() else { break };
                if let Err(e) = strong.recover().await {
                    tracing::error!(error = %e, "recovery sweep failed");
                }
            }
        })
    }

    /// Save a new execution and run it in the background
    pub async fn submit_plan(
        &self,
        plan: Vec<PlanStep>,
        context: Context,
        session_id: Option<String>,
    ) -> Result<String> {
        let (state, handle) = self.start(plan, context, session_id).await?;
        let id = state.id.clone();
        let executor = self.sequential.clone();

        tokio::spawn(async move {
            let outcome = handle.keep_alive(executor.drive(state, handle.token())).await;
            log_outcome(handle.id(), &outcome);
        });

        Ok(id)
    }

    /// Plan `goal`, then submit the plan
    pub async fn submit_goal(
        &self,
        goal: &str,
        context: Context,
        session_id: Option<String>,
    ) -> Result<String> {
        let plan = self.planner()?.create_plan(goal, &context).await?;
        self.submit_plan(plan, context, session_id).await
    }

    /// Save a new execution and run it to completion, failure or suspension
    pub async fn run_plan(
        &self,
        plan: Vec<PlanStep>,
        context: Context,
        session_id: Option<String>,
    ) -> Result<ExecutionReport> {
        let (state, handle) = self.start(plan, context, session_id).await?;
        handle
            .keep_alive(self.sequential.drive(state, handle.token()))
            .await
    }

    pub async fn run_goal(
        &self,
        goal: &str,
        context: Context,
        session_id: Option<String>,
    ) -> Result<ExecutionReport> {
        let plan = self.planner()?.create_plan(goal, &context).await?;
        self.run_plan(plan, context, session_id).await
    }

    /// Approve the pending step and continue. Terminal executions are left
    /// alone and their stored report is returned.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionReport> {
        if self.live.is_live(execution_id) {
            return Err(EngineError::AlreadyRunning(execution_id.to_string()));
        }

        match self.sequential.begin_resume(execution_id).await? {
            Resumption::Finished(report) => Ok(report),
            Resumption::Continue(mut state) => {
                let handle = self
                    .live
                    .register(execution_id)
                    .ok_or_else(|| EngineError::AlreadyRunning(execution_id.to_string()))?;
                self.sequential.persist(&mut state).await?;
                tracing::info!(execution_id, step_index = state.current_step_index, "execution resumed");
                handle
                    .keep_alive(self.sequential.drive(state, handle.token()))
                    .await
            }
        }
    }

    /// Request cancellation. Live executions are interrupted by their owner;
    /// suspended ones are cancelled in the store. Returns false for unknown
    /// or terminal executions.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        if self.live.cancel(execution_id) {
            tracing::info!(execution_id, "cancellation requested");
            return Ok(true);
        }

        let Some(mut state) = self.store.load(execution_id).await? else {
            return Ok(false);
        };
        if state.status != ExecutionStatus::PendingApproval {
            return Ok(false);
        }

        state.status = ExecutionStatus::Cancelled;
        state.failure_reason = Some("cancelled while waiting for approval".to_string());
        state.touch();
        match self.store.save(&state).await {
            Ok(()) => {
                tracing::info!(execution_id, "suspended execution cancelled");
                let _ = self.events.send(ExecutionEvent::Cancelled {
                    execution_id: execution_id.to_string(),
                });
                Ok(true)
            }
            Err(EngineError::TerminalStateMutation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current status. An in-flight record without a live owner is failed
    /// on the spot.
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        Ok(self.observe(execution_id).await?.status)
    }

    pub async fn report(&self, execution_id: &str) -> Result<ExecutionReport> {
        Ok(ExecutionReport::from(&self.observe(execution_id).await?))
    }

    pub async fn list(&self) -> Result<Vec<ExecutionState>> {
        self.store.list().await
    }

    /// Poll until no task owns the execution, then return its report
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionReport> {
        let mut interval = tokio::time::interval(WAIT_POLL_INTERVAL);
        while self.live.is_live(execution_id) {
            interval.tick().await;
        }
        self.report(execution_id).await
    }

    /// Validate and run a workflow to completion under a fresh id
    pub async fn run_workflow(
        &self,
        nodes: Vec<WorkflowNode>,
        context: Context,
    ) -> Result<WorkflowReport> {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        self.run_workflow_as(&workflow_id, nodes, context).await
    }

    /// Run a workflow under a caller-chosen id, so the caller can
    /// [`cancel`](Self::cancel) it without subscribing to events. Fails with
    /// `AlreadyRunning` if the id is live.
    pub async fn run_workflow_as(
        &self,
        workflow_id: &str,
        nodes: Vec<WorkflowNode>,
        context: Context,
    ) -> Result<WorkflowReport> {
        let graph = WorkflowGraph::build(nodes)?;
        let handle = self
            .live
            .register(workflow_id)
            .ok_or_else(|| EngineError::AlreadyRunning(workflow_id.to_string()))?;

        handle
            .keep_alive(self.graph.execute(workflow_id, &graph, context, handle.token()))
            .await
    }

    /// Plan a workflow for `goal`, then run it
    pub async fn run_goal_workflow(&self, goal: &str, context: Context) -> Result<WorkflowReport> {
        let nodes = self.planner()?.create_workflow(goal, &context).await?;
        self.run_workflow(nodes, context).await
    }

    async fn start(
        &self,
        plan: Vec<PlanStep>,
        context: Context,
        session_id: Option<String>,
    ) -> Result<(ExecutionState, LiveHandle)> {
        let mut state = SequentialExecutor::prepare(plan, context, session_id);
        let handle = self
            .live
            .register(&state.id)
            .ok_or_else(|| EngineError::AlreadyRunning(state.id.clone()))?;
        self.sequential.persist(&mut state).await?;
        Ok((state, handle))
    }

    async fn observe(&self, execution_id: &str) -> Result<ExecutionState> {
        let mut state = self
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        if state.status.is_in_flight() && !self.live.is_live(execution_id) {
            state.fail(INTERRUPTED_REASON);
            match self.store.save(&state).await {
                Ok(()) => {
                    tracing::warn!(execution_id, "orphaned execution marked failed");
                }
                // Finished between the load and the save
                Err(EngineError::TerminalStateMutation(_)) => {
                    return self
                        .store
                        .load(execution_id)
                        .await?
                        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(state)
    }

    fn planner(&self) -> Result<&Planner> {
        self.planner
            .as_deref()
            .ok_or_else(|| EngineError::Config("no reasoning backend configured for planning".into()))
    }
}

fn log_outcome(execution_id: &str, outcome: &Result<ExecutionReport>) {
    match outcome {
        Ok(report) => {
            tracing::info!(execution_id, status = %report.status, "background execution stopped")
        }
        Err(EngineError::Cancelled(_)) => {
            tracing::info!(execution_id, "background execution cancelled")
        }
        Err(e) => {
            tracing::warn!(execution_id, code = e.code(), error = %e, "background execution failed")
        }
    }
}
