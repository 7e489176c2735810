use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::capability::{Context, StepResult};
use crate::error::EngineError;
use crate::planning::PlanStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    PendingApproval,
    ResumedAfterApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 3] = [
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    /// Statuses that imply a live executor owns the record
    pub const IN_FLIGHT: [ExecutionStatus; 2] = [
        ExecutionStatus::Running,
        ExecutionStatus::ResumedAfterApproval,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::PendingApproval => "PENDING_APPROVAL",
            ExecutionStatus::ResumedAfterApproval => "RESUMED_AFTER_APPROVAL",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "PENDING_APPROVAL" => Ok(ExecutionStatus::PendingApproval),
            "RESUMED_AFTER_APPROVAL" => Ok(ExecutionStatus::ResumedAfterApproval),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(EngineError::Persistence(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Persisted record of one sequential execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: ExecutionStatus,
    pub plan_steps: Vec<PlanStep>,
    pub accumulated_context: Context,
    pub execution_history: Vec<StepResult>,
    pub current_step_index: usize,
    /// Remediation attempts spent on the current step
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(plan_steps: Vec<PlanStep>, context: Context, session_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            status: ExecutionStatus::Running,
            plan_steps,
            accumulated_context: context,
            execution_history: Vec::new(),
            current_step_index: 0,
            recovery_attempts: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.plan_steps.get(self.current_step_index)
    }

    /// Mark the record terminal with a failure reason
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.touch();
    }

    /// History entries produced by running a capability, without markers
    pub fn real_results(&self) -> impl Iterator<Item = &StepResult> {
        self.execution_history
            .iter()
            .filter(|result| !result.status.is_marker())
    }
}
