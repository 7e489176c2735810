//! Error types for the execution engine

use thiserror::Error;

/// Result type alias using the engine's error
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error taxonomy
///
/// Step-local failures (`CapabilityNotFound`, `CapabilityFailure`) are routed
/// through remediation before they can terminate an execution. The remaining
/// variants are surfaced to the caller as-is.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The planner or advisor could not produce valid structured output
    #[error("Planning failed: {message}")]
    Planning {
        message: String,
        /// Best-effort raw backend output, kept for postmortem
        raw_output: Option<String>,
    },

    #[error("Capability '{0}' is not registered")]
    CapabilityNotFound(String),

    #[error("Capability '{agent}' failed: {message}")]
    CapabilityFailure { agent: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Recovery budget exhausted for '{agent}' after {attempts} remediation attempts: {last_error}")]
    RecoveryBudgetExhausted {
        agent: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Execution abandoned at '{agent}': {justification}")]
    RemediationAbandoned { agent: String, justification: String },

    #[error("Reasoning backend unavailable: {0}")]
    ReasoningUnavailable(String),

    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Execution '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Execution '{0}' was cancelled")]
    Cancelled(String),

    #[error("Execution '{0}' is terminal and cannot be modified")]
    TerminalStateMutation(String),

    #[error("Capability '{0}' registered more than once")]
    DuplicateCapability(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a planning error that carries the raw backend output
    pub fn planning(message: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
            raw_output: Some(raw_output.into()),
        }
    }

    /// Build a planning error with no backend output attached
    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
            raw_output: None,
        }
    }

    /// Raw backend output attached to a planning failure, if any
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::Planning { raw_output, .. } => raw_output.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure is local to one step and may be remediated
    pub fn is_step_local(&self) -> bool {
        matches!(
            self,
            Self::CapabilityNotFound(_) | Self::CapabilityFailure { .. }
        )
    }

    /// Short machine-readable code for logs and the CLI
    pub fn code(&self) -> &'static str {
        match self {
            Self::Planning { .. } => "planning_error",
            Self::CapabilityNotFound(_) => "capability_not_found",
            Self::CapabilityFailure { .. } => "capability_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::RecoveryBudgetExhausted { .. } => "recovery_budget_exhausted",
            Self::RemediationAbandoned { .. } => "remediation_abandoned",
            Self::ReasoningUnavailable(_) => "reasoning_unavailable",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::Cancelled(_) => "cancelled",
            Self::TerminalStateMutation(_) => "terminal_state_mutation",
            Self::DuplicateCapability(_) => "duplicate_capability",
            Self::Config(_) => "config_error",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization failed: {}", err))
    }
}
