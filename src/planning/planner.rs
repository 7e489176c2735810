//! LLM-based planner
//!
//! Turns a goal plus context into an ordered plan or a workflow graph. The
//! answer is parsed strictly first, then leniently; if both fail the model
//! gets exactly one re-ask before the planner gives up.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::capability::{CapabilityRegistry, Context};
use crate::error::{EngineError, Result};
use crate::llm::LlmClient;

use super::json::{parse_lenient, parse_strict};
use super::types::{PlanStep, WorkflowNode};

const PLAN_SCHEMA: &str = r#"[
  {"agentName": "<capability name>", "arguments": {"<key>": <value>}}
]"#;

const WORKFLOW_SCHEMA: &str = r#"[
  {"id": "<unique node id>", "agentName": "<capability name>", "arguments": {"<key>": <value>}, "dependencies": ["<node id>"]}
]"#;

const PLAN_PROMPT: &str = r#"You are a planning engine. Break the goal into an ordered list of steps.
Each step invokes exactly one capability from the catalog below.

## Capabilities
{catalog}

## Goal
{goal}

## Current context
{context}

## Output format
Respond with ONLY a JSON array (no markdown, no explanation) matching:
{schema}"#;

const WORKFLOW_PROMPT: &str = r#"You are a planning engine. Break the goal into a graph of steps.
Each node invokes exactly one capability from the catalog below and lists the ids of the nodes
whose results it needs. Nodes without dependencies between them run in parallel.

## Capabilities
{catalog}

## Goal
{goal}

## Current context
{context}

## Output format
Respond with ONLY a JSON array (no markdown, no explanation) matching:
{schema}"#;

const REASK_PROMPT: &str = r#"Your previous answer could not be parsed:

{raw}

Return ONLY the JSON array matching this schema, with no other text:
{schema}"#;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct StrictStep {
    agent_name: String,
    arguments: Context,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct StrictNode {
    id: String,
    agent_name: String,
    arguments: Context,
    dependencies: BTreeSet<String>,
}

const AGENT_KEYS: &[&str] = &["agentName", "agent_name", "agent", "capability", "tool", "name"];
const ARGUMENT_KEYS: &[&str] = &["arguments", "args", "parameters", "params", "input"];
const ID_KEYS: &[&str] = &["id", "nodeId", "node_id", "key"];
const DEPENDENCY_KEYS: &[&str] = &["dependencies", "dependsOn", "depends_on", "deps", "after"];
const WRAPPER_KEYS: &[&str] = &["steps", "plan", "nodes", "workflow", "tasks"];

/// Produces plans and workflows through the reasoning backend
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { llm, registry }
    }

    /// Plan an ordered list of steps for `goal`
    pub async fn create_plan(&self, goal: &str, context: &Context) -> Result<Vec<PlanStep>> {
        let prompt = self.render(PLAN_PROMPT, PLAN_SCHEMA, goal, context);
        let steps = self.ask_with_repair(&prompt, PLAN_SCHEMA, parse_plan).await?;
        tracing::info!(steps = steps.len(), "plan created");
        Ok(steps)
    }

    /// Plan a dependency graph for `goal`
    ///
    /// The graph is not validated here; `WorkflowGraph::build` does that.
    pub async fn create_workflow(
        &self,
        goal: &str,
        context: &Context,
    ) -> Result<Vec<WorkflowNode>> {
        let prompt = self.render(WORKFLOW_PROMPT, WORKFLOW_SCHEMA, goal, context);
        let nodes = self
            .ask_with_repair(&prompt, WORKFLOW_SCHEMA, parse_workflow)
            .await?;
        tracing::info!(nodes = nodes.len(), "workflow created");
        Ok(nodes)
    }

    fn render(&self, template: &str, schema: &str, goal: &str, context: &Context) -> String {
        let context_json = serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".into());
        template
            .replace("{catalog}", &self.registry.catalog_json())
            .replace("{goal}", goal)
            .replace("{context}", &context_json)
            .replace("{schema}", schema)
    }

    async fn ask_with_repair<T>(
        &self,
        prompt: &str,
        schema: &str,
        parse: fn(&str) -> Option<T>,
    ) -> Result<T> {
        let raw = self.ask(prompt).await?;
        if let Some(parsed) = parse(&raw) {
            return Ok(parsed);
        }

        tracing::warn!("planner output was not valid JSON, re-asking once");
        let reask = format!(
            "{}\n\n{}",
            prompt,
            REASK_PROMPT.replace("{raw}", &raw).replace("{schema}", schema)
        );
        let retry_raw = self.ask(&reask).await?;

        parse(&retry_raw).ok_or_else(|| {
            EngineError::planning(
                "planner output could not be parsed after one re-ask",
                format!("{}\n--- re-ask ---\n{}", raw, retry_raw),
            )
        })
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        self.llm
            .complete(prompt)
            .await
            .map_err(|e| EngineError::ReasoningUnavailable(format!("{:#}", e)))
    }
}

/// Strict parse, then lenient
pub fn parse_plan(raw: &str) -> Option<Vec<PlanStep>> {
    if let Ok(steps) = parse_strict::<Vec<StrictStep>>(raw) {
        return Some(
            steps
                .into_iter()
                .map(|s| PlanStep {
                    agent_name: s.agent_name,
                    arguments: s.arguments,
                })
                .collect(),
        );
    }

    lenient_items(raw)?
        .iter()
        .map(|item| {
            let obj = item_object(item)?;
            Some(PlanStep {
                agent_name: agent_of(&obj)?,
                arguments: arguments_of(&obj),
            })
        })
        .collect()
}

/// Strict parse, then lenient
pub fn parse_workflow(raw: &str) -> Option<Vec<WorkflowNode>> {
    if let Ok(nodes) = parse_strict::<Vec<StrictNode>>(raw) {
        return Some(
            nodes
                .into_iter()
                .map(|n| WorkflowNode {
                    id: n.id,
                    agent_name: n.agent_name,
                    arguments: n.arguments,
                    dependencies: n.dependencies,
                })
                .collect(),
        );
    }

    lenient_items(raw)?
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let obj = item_object(item)?;
            let id = first_of(&obj, ID_KEYS)
                .and_then(scalar_string)
                .unwrap_or_else(|| format!("node-{}", index + 1));
            Some(WorkflowNode {
                id,
                agent_name: agent_of(&obj)?,
                arguments: arguments_of(&obj),
                dependencies: dependencies_of(&obj),
            })
        })
        .collect()
}

/// Unwrap the lenient value into a list of items: a bare array, an array
/// under a wrapper key, or a single object.
fn lenient_items(raw: &str) -> Option<Vec<Value>> {
    match parse_lenient(raw)? {
        Value::Array(items) => Some(items),
        Value::Object(obj) => {
            if let Some(items) = WRAPPER_KEYS
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_array))
            {
                return Some(items.clone());
            }
            if first_of(&obj, AGENT_KEYS).is_some() {
                return Some(vec![Value::Object(obj)]);
            }
            None
        }
        _ => None,
    }
}

fn item_object(item: &Value) -> Option<Context> {
    match item {
        Value::Object(obj) => Some(obj.clone()),
        Value::String(name) => {
            let mut obj = Context::new();
            obj.insert("agentName".to_string(), Value::String(name.clone()));
            Some(obj)
        }
        _ => None,
    }
}

fn first_of<'a>(obj: &'a Context, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn agent_of(obj: &Context) -> Option<String> {
    first_of(obj, AGENT_KEYS).and_then(scalar_string)
}

fn arguments_of(obj: &Context) -> Context {
    first_of(obj, ARGUMENT_KEYS)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn dependencies_of(obj: &Context) -> BTreeSet<String> {
    match first_of(obj, DEPENDENCY_KEYS) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other).into_iter().collect(),
        None => BTreeSet::new(),
    }
}
