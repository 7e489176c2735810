//! Sequential plan executor
//!
//! State machine:
//!
//! ```text
//! RUNNING -> (PENDING_APPROVAL -> RESUMED_AFTER_APPROVAL ->) RUNNING -> COMPLETED | FAILED
//! ```
//!
//! plus CANCELLED from any non-terminal status. Every transition is saved
//! before the next step starts, so a reader of the store never observes a
//! half-applied step.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{event_channel, ExecutionEvent, ExecutionReport};
use crate::capability::{
    merge_details, overlay_arguments, CapabilityRegistry, Context, ResultStatus, StepResult,
};
use crate::error::{EngineError, Result};
use crate::persistence::{ExecutionState, ExecutionStatus, ExecutionStore};
use crate::planning::{PlanStep, RemediationAction, RemediationAdvisor};

pub const DEFAULT_RECOVERY_BUDGET: u32 = 2;

const CANCELLED_REASON: &str = "cancelled by request";

/// Outcome of preparing a resume
pub enum Resumption {
    /// The execution is terminal; nothing to do
    Finished(ExecutionReport),
    /// Marked RESUMED_AFTER_APPROVAL but not yet saved
    Continue(ExecutionState),
}

pub struct SequentialExecutor {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn ExecutionStore>,
    advisor: Arc<dyn RemediationAdvisor>,
    recovery_budget: u32,
    events: broadcast::Sender<ExecutionEvent>,
}

impl SequentialExecutor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn ExecutionStore>,
        advisor: Arc<dyn RemediationAdvisor>,
    ) -> Self {
        Self {
            registry,
            store,
            advisor,
            recovery_budget: DEFAULT_RECOVERY_BUDGET,
            events: event_channel(),
        }
    }

    pub fn with_recovery_budget(mut self, budget: u32) -> Self {
        self.recovery_budget = budget;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<ExecutionEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Allocate a new execution record without saving it
    pub fn prepare(
        plan: Vec<PlanStep>,
        context: Context,
        session_id: Option<String>,
    ) -> ExecutionState {
        ExecutionState::new(plan, context, session_id)
    }

    /// Stamp and save the record
    pub async fn persist(&self, state: &mut ExecutionState) -> Result<()> {
        state.touch();
        self.store.save(state).await
    }

    /// Allocate, save and run a plan until it completes, fails or suspends
    pub async fn submit(
        &self,
        plan: Vec<PlanStep>,
        context: Context,
        session_id: Option<String>,
    ) -> Result<ExecutionReport> {
        let mut state = Self::prepare(plan, context, session_id);
        self.persist(&mut state).await?;
        self.drive(state, &CancellationToken::new()).await
    }

    /// Load a record and get it ready to continue past its approval gate
    pub async fn begin_resume(&self, execution_id: &str) -> Result<Resumption> {
        let mut state = self
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        match state.status {
            status if status.is_terminal() => {
                tracing::debug!(execution_id, %status, "resume on terminal execution is a no-op");
                Ok(Resumption::Finished(ExecutionReport::from(&state)))
            }
            ExecutionStatus::PendingApproval => {
                state.status = ExecutionStatus::ResumedAfterApproval;
                Ok(Resumption::Continue(state))
            }
            _ => Err(EngineError::AlreadyRunning(execution_id.to_string())),
        }
    }

    /// Approve the pending step and continue the execution
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionReport> {
        match self.begin_resume(execution_id).await? {
            Resumption::Finished(report) => Ok(report),
            Resumption::Continue(mut state) => {
                self.persist(&mut state).await?;
                self.drive(state, &CancellationToken::new()).await
            }
        }
    }

    /// Run the step loop from `current_step_index`. The record must already
    /// be saved in its current status.
    pub async fn drive(
        &self,
        mut state: ExecutionState,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        if state.current_step_index == 0 && state.execution_history.is_empty() {
            tracing::info!(execution_id = %state.id, steps = state.plan_steps.len(), "execution started");
            self.emit(ExecutionEvent::Started {
                execution_id: state.id.clone(),
                steps: state.plan_steps.len(),
            });
        }

        while let Some(step) = state.current_step().cloned() {
            if cancel.is_cancelled() {
                return self.cancelled(state).await;
            }

            let index = state.current_step_index;
            let capability = self.registry.lookup(&step.agent_name);

            if let Some(capability) = &capability {
                if capability.requires_approval()
                    && state.status != ExecutionStatus::ResumedAfterApproval
                {
                    state.status = ExecutionStatus::PendingApproval;
                    state
                        .execution_history
                        .push(StepResult::approval_gate(&step.agent_name, index));
                    self.persist(&mut state).await?;

                    tracing::info!(
                        execution_id = %state.id,
                        step_index = index,
                        agent = %step.agent_name,
                        "waiting for approval"
                    );
                    self.emit(ExecutionEvent::ApprovalRequired {
                        execution_id: state.id.clone(),
                        step_index: index,
                        agent: step.agent_name.clone(),
                    });
                    return Ok(ExecutionReport::from(&state));
                }
            }

            tracing::debug!(execution_id = %state.id, step_index = index, agent = %step.agent_name, "running step");
            self.emit(ExecutionEvent::StepStarted {
                execution_id: state.id.clone(),
                step_index: index,
                agent: step.agent_name.clone(),
            });

            let input = overlay_arguments(&state.accumulated_context, &step.arguments);
            let outcome = match capability {
                None => StepResult::failure(
                    &step.agent_name,
                    EngineError::CapabilityNotFound(step.agent_name.clone()).to_string(),
                ),
                Some(capability) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.cancelled(state).await,
                        result = capability.execute(input) => match result {
                            Ok(result) => result,
                            Err(e) => StepResult::failure(
                                &step.agent_name,
                                EngineError::CapabilityFailure {
                                    agent: step.agent_name.clone(),
                                    message: format!("{:#}", e),
                                }
                                .to_string(),
                            ),
                        },
                    }
                }
            };

            if outcome.is_success() {
                merge_details(&mut state.accumulated_context, &outcome.details);
                state.execution_history.push(outcome.clone());
                state.current_step_index += 1;
                state.recovery_attempts = 0;
                state.status = ExecutionStatus::Running;
                self.persist(&mut state).await?;

                self.emit(ExecutionEvent::StepCompleted {
                    execution_id: state.id.clone(),
                    step_index: index,
                    result: outcome,
                });
                continue;
            }

            self.remediate(&mut state, &step, outcome, cancel).await?;
        }

        state.status = ExecutionStatus::Completed;
        self.persist(&mut state).await?;
        tracing::info!(execution_id = %state.id, "execution completed");
        self.emit(ExecutionEvent::Completed {
            execution_id: state.id.clone(),
        });

        Ok(ExecutionReport::from(&state))
    }

    /// Record a failed step and apply the advisor's verdict. Returns `Ok`
    /// when the step should be retried; every other outcome is terminal and
    /// has already been saved.
    async fn remediate(
        &self,
        state: &mut ExecutionState,
        step: &PlanStep,
        failure: StepResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let index = state.current_step_index;
        let error = failure.summary.clone();
        let mut failure = failure;
        failure.status = ResultStatus::Failure;
        state.execution_history.push(failure);

        tracing::warn!(
            execution_id = %state.id,
            step_index = index,
            agent = %step.agent_name,
            attempts = state.recovery_attempts,
            error = %error,
            "step failed"
        );

        if state.recovery_attempts >= self.recovery_budget {
            let err = EngineError::RecoveryBudgetExhausted {
                agent: step.agent_name.clone(),
                attempts: state.recovery_attempts,
                last_error: error,
            };
            return Err(self.terminate(state, err).await);
        }

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.mark_cancelled(state).await),
            verdict = self.advisor.advise(&step.agent_name, &step.arguments, &error) => verdict,
        };

        let plan = match verdict {
            Ok(plan) => plan,
            Err(e) => {
                let reason = format!("remediation advisor failed: {}", e);
                state.fail(reason.clone());
                self.persist(state).await?;
                self.emit(ExecutionEvent::Failed {
                    execution_id: state.id.clone(),
                    reason,
                });
                return Err(e);
            }
        };

        match plan.action {
            RemediationAction::RetryWithFix => {
                if let Some(arguments) = plan.modified_arguments {
                    state.plan_steps[index].arguments = arguments;
                }
                state.recovery_attempts += 1;
                self.persist(state).await?;

                tracing::info!(
                    execution_id = %state.id,
                    step_index = index,
                    attempt = state.recovery_attempts,
                    "retrying step with fix"
                );
                self.emit(ExecutionEvent::RemediationApplied {
                    execution_id: state.id.clone(),
                    step_index: index,
                    agent: step.agent_name.clone(),
                    attempt: state.recovery_attempts,
                    justification: plan.justification,
                });
                Ok(())
            }
            RemediationAction::FailGracefully => {
                let err = EngineError::RemediationAbandoned {
                    agent: step.agent_name.clone(),
                    justification: plan.justification,
                };
                Err(self.terminate(state, err).await)
            }
        }
    }

    /// Save FAILED with the error as reason and hand the error back. A save
    /// failure takes precedence.
    async fn terminate(&self, state: &mut ExecutionState, err: EngineError) -> EngineError {
        let reason = err.to_string();
        state.fail(reason.clone());
        if let Err(save_err) = self.persist(state).await {
            return save_err;
        }
        tracing::warn!(execution_id = %state.id, reason = %reason, "execution failed");
        self.emit(ExecutionEvent::Failed {
            execution_id: state.id.clone(),
            reason,
        });
        err
    }

    async fn cancelled(&self, mut state: ExecutionState) -> Result<ExecutionReport> {
        Err(self.mark_cancelled(&mut state).await)
    }

    async fn mark_cancelled(&self, state: &mut ExecutionState) -> EngineError {
        state.status = ExecutionStatus::Cancelled;
        state.failure_reason = Some(CANCELLED_REASON.to_string());
        if let Err(save_err) = self.persist(state).await {
            return save_err;
        }

        tracing::info!(execution_id = %state.id, step_index = state.current_step_index, "execution cancelled");
        self.emit(ExecutionEvent::Cancelled {
            execution_id: state.id.clone(),
        });
        EngineError::Cancelled(state.id.clone())
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
