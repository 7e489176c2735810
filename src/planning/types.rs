use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::capability::Context;

/// One entry of an ordered plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub agent_name: String,
    #[serde(default)]
    pub arguments: Context,
}

impl PlanStep {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            arguments: Context::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Context) -> Self {
        self.arguments = arguments;
        self
    }
}

/// One node of a dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    pub agent_name: String,
    #[serde(default)]
    pub arguments: Context,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_name: agent_name.into(),
            arguments: Context::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Context) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationAction {
    RetryWithFix,
    FailGracefully,
}

/// Verdict returned by a remediation advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPlan {
    pub action: RemediationAction,
    pub justification: String,
    /// Replacement arguments for the failing step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_arguments: Option<Context>,
}

impl RemediationPlan {
    pub fn retry_with(justification: impl Into<String>, arguments: Context) -> Self {
        Self {
            action: RemediationAction::RetryWithFix,
            justification: justification.into(),
            modified_arguments: Some(arguments),
        }
    }

    pub fn fail(justification: impl Into<String>) -> Self {
        Self {
            action: RemediationAction::FailGracefully,
            justification: justification.into(),
            modified_arguments: None,
        }
    }
}
