use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::capability::Context;
use crate::error::{EngineError, Result};
use crate::llm::LlmClient;

use super::json::{parse_lenient, parse_strict};
use super::types::{RemediationAction, RemediationPlan};

/// Longest error excerpt forwarded to the backend, in characters
const MAX_ERROR_EXCERPT: usize = 2000;

const REMEDIATION_PROMPT: &str = r#"A step in an automated plan failed. Decide whether it can be fixed by retrying with different arguments.

## Capability
{agent}

## Arguments used
{arguments}

## Error
{error}

## Output format
Respond with ONLY a JSON object (no markdown, no explanation):
{"action": "RETRY_WITH_FIX" | "FAIL_GRACEFULLY", "justification": "<one sentence>", "modifiedArguments": {<full replacement arguments, only for RETRY_WITH_FIX>}}"#;

/// Decides whether a failed step is retried with new arguments or abandoned
///
/// Implementations make one decision per call. The executor owns the attempt
/// budget.
#[async_trait]
pub trait RemediationAdvisor: Send + Sync {
    async fn advise(
        &self,
        agent_name: &str,
        arguments: &Context,
        error: &str,
    ) -> Result<RemediationPlan>;
}

/// Advisor backed by one reasoning call per failure
pub struct LlmRemediationAdvisor {
    llm: Arc<dyn LlmClient>,
}

impl LlmRemediationAdvisor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl RemediationAdvisor for LlmRemediationAdvisor {
    async fn advise(
        &self,
        agent_name: &str,
        arguments: &Context,
        error: &str,
    ) -> Result<RemediationPlan> {
        let arguments_json =
            serde_json::to_string_pretty(arguments).unwrap_or_else(|_| "{}".into());
        let prompt = REMEDIATION_PROMPT
            .replace("{agent}", agent_name)
            .replace("{arguments}", &arguments_json)
            .replace("{error}", &excerpt(error));

        let raw = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| EngineError::ReasoningUnavailable(format!("{:#}", e)))?;

        let plan = parse_remediation(&raw)
            .ok_or_else(|| EngineError::planning("remediation verdict could not be parsed", raw))?;

        tracing::info!(
            agent = agent_name,
            action = ?plan.action,
            justification = %plan.justification,
            "remediation verdict"
        );
        Ok(plan)
    }
}

/// Abandons every failure. Used when no reasoning backend is configured.
pub struct FailFastAdvisor;

#[async_trait]
impl RemediationAdvisor for FailFastAdvisor {
    async fn advise(
        &self,
        _agent_name: &str,
        _arguments: &Context,
        error: &str,
    ) -> Result<RemediationPlan> {
        Ok(RemediationPlan::fail(format!(
            "no remediation backend configured: {}",
            excerpt(error)
        )))
    }
}

fn excerpt(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_EXCERPT {
        error.to_string()
    } else {
        let head: String = error.chars().take(MAX_ERROR_EXCERPT).collect();
        format!("{}... [truncated]", head)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct StrictVerdict {
    action: RemediationAction,
    justification: String,
    #[serde(default)]
    modified_arguments: Option<Context>,
}

/// Strict parse, then lenient
pub fn parse_remediation(raw: &str) -> Option<RemediationPlan> {
    if let Ok(verdict) = parse_strict::<StrictVerdict>(raw) {
        return Some(RemediationPlan {
            action: verdict.action,
            justification: verdict.justification,
            modified_arguments: verdict.modified_arguments,
        });
    }

    let mut obj = match parse_lenient(raw)? {
        Value::Object(obj) => obj,
        Value::Array(items) => match items.into_iter().next()? {
            Value::Object(obj) => obj,
            _ => return None,
        },
        _ => return None,
    };
    for wrapper in ["remediation", "verdict", "plan"] {
        if let Some(Value::Object(inner)) = obj.get(wrapper) {
            obj = inner.clone();
            break;
        }
    }

    let action = ["action", "verdict", "decision"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .and_then(normalize_action)?;
    let justification = ["justification", "reason", "rationale", "explanation"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let modified_arguments = [
        "modifiedArguments",
        "modified_arguments",
        "arguments",
        "args",
    ]
    .iter()
    .find_map(|key| obj.get(*key).and_then(Value::as_object))
    .cloned();

    Some(RemediationPlan {
        action,
        justification,
        modified_arguments,
    })
}

fn normalize_action(action: &str) -> Option<RemediationAction> {
    let normalized = action.trim().to_uppercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "RETRY_WITH_FIX" | "RETRY" | "FIX" | "RETRY_WITH_FIXES" => {
            Some(RemediationAction::RetryWithFix)
        }
        "FAIL_GRACEFULLY" | "FAIL" | "ABANDON" | "ABORT" | "GIVE_UP" => {
            Some(RemediationAction::FailGracefully)
        }
        _ => None,
    }
}
