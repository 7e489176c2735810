use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key-value store threaded through every step of one execution
pub type Context = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failure,
    /// Synthetic marker recorded when a step waits for approval
    ApprovalRequired,
    /// Synthetic marker for a workflow node whose dependency failed
    Skipped,
}

impl ResultStatus {
    /// Markers are bookkeeping entries, not outcomes of running a capability
    pub fn is_marker(&self) -> bool {
        matches!(self, ResultStatus::ApprovalRequired | ResultStatus::Skipped)
    }
}

/// Outcome of one capability invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub agent_name: String,
    pub status: ResultStatus,
    pub summary: String,
    /// Merged into the execution context on success
    #[serde(default)]
    pub details: Context,
}

impl StepResult {
    pub fn success(agent_name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: ResultStatus::Success,
            summary: summary.into(),
            details: Context::new(),
        }
    }

    pub fn failure(agent_name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: ResultStatus::Failure,
            summary: summary.into(),
            details: Context::new(),
        }
    }

    /// The synthetic result appended to history when a step is gated
    pub fn approval_gate(agent_name: impl Into<String>, step_index: usize) -> Self {
        let agent_name = agent_name.into();
        let mut details = Context::new();
        details.insert("approvalGate".to_string(), Value::Bool(true));
        details.insert("stepIndex".to_string(), Value::from(step_index));
        Self {
            summary: format!("Step {} ({}) is waiting for approval", step_index, agent_name),
            agent_name,
            status: ResultStatus::ApprovalRequired,
            details,
        }
    }

    pub fn skipped(
        agent_name: impl Into<String>,
        node_id: &str,
        failed_dependency: &str,
    ) -> Self {
        let mut details = Context::new();
        details.insert("nodeId".to_string(), Value::from(node_id));
        details.insert(
            "failedDependency".to_string(),
            Value::from(failed_dependency),
        );
        Self {
            agent_name: agent_name.into(),
            status: ResultStatus::Skipped,
            summary: format!(
                "Skipped '{}': dependency '{}' did not succeed",
                node_id, failed_dependency
            ),
            details,
        }
    }

    pub fn with_details(mut self, details: Context) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ResultStatus::Failure
    }
}

/// Merge `details` into `context`, last writer wins
pub fn merge_details(context: &mut Context, details: &Context) {
    for (key, value) in details {
        context.insert(key.clone(), value.clone());
    }
}

/// Build a step input: the step's own arguments overlaid on the shared context
pub fn overlay_arguments(context: &Context, arguments: &Context) -> Context {
    let mut input = context.clone();
    merge_details(&mut input, arguments);
    input
}
