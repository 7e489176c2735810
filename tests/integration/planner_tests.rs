use super::common::*;
use planwright::capability::{CapabilityRegistry, StepResult};
use planwright::execution::SequentialExecutor;
use planwright::persistence::{ExecutionStatus, ExecutionStore, MemoryExecutionStore};
use planwright::planning::{
    LlmRemediationAdvisor, PlanStep, Planner, RemediationAction, RemediationAdvisor,
};
use planwright::EngineError;
use serde_json::json;
use std::sync::Arc;

fn planner(llm: Arc<ScriptedLlm>) -> Planner {
    Planner::new(llm, Arc::new(CapabilityRegistry::with_builtins().unwrap()))
}

#[tokio::test]
async fn test_fenced_plan_is_accepted_first_time() {
    let llm = ScriptedLlm::new(&[
        "Here you go:\n```json\n[{\"agentName\": \"echo\", \"arguments\": {\"a\": 1}}, {\"agentName\": \"sleep\", \"arguments\": {\"ms\": 5}}]\n```",
    ]);
    let steps = planner(llm.clone())
        .create_plan("seed a value then wait", &ctx(json!({"x": 1})))
        .await
        .unwrap();

    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].agent_name, "echo");
    assert_eq!(steps[0].arguments.get("a"), Some(&json!(1)));
    assert_eq!(steps[1].agent_name, "sleep");
    assert_eq!(llm.prompt_count(), 1);

    // The prompt carries the catalog and the goal
    let prompt = llm.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("seed a value then wait"));
    assert!(prompt.contains("shell"));
}

#[tokio::test]
async fn test_sloppy_json_is_repaired_without_reask() {
    let llm = ScriptedLlm::new(&[
        "[ // one step\n{'agent': 'echo', 'args': {'flag': True,},},]",
    ]);
    let steps = planner(llm.clone())
        .create_plan("anything", &ctx(json!({})))
        .await
        .unwrap();

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].agent_name, "echo");
    assert_eq!(steps[0].arguments.get("flag"), Some(&json!(true)));
    assert_eq!(llm.prompt_count(), 1);
}

#[tokio::test]
async fn test_bracketed_prose_after_plan_needs_no_reask() {
    let llm = ScriptedLlm::new(&[
        "Here is the plan:\n[{\"agentName\": \"echo\", \"arguments\": {}}]\nNote: see reference [1].",
    ]);
    let steps = planner(llm.clone())
        .create_plan("anything", &ctx(json!({})))
        .await
        .unwrap();

    assert_eq!(steps, vec![PlanStep::new("echo")]);
    assert_eq!(llm.prompt_count(), 1);
}

#[tokio::test]
async fn test_unparseable_output_gets_one_reask() {
    let llm = ScriptedLlm::new(&[
        "I think you should run echo.",
        "[{\"agentName\": \"echo\", \"arguments\": {}}]",
    ]);
    let steps = planner(llm.clone())
        .create_plan("anything", &ctx(json!({})))
        .await
        .unwrap();

    assert_eq!(steps, vec![PlanStep::new("echo")]);
    assert_eq!(llm.prompt_count(), 2);
    let reask = llm.prompts.lock().unwrap()[1].clone();
    assert!(reask.contains("I think you should run echo."));
}

#[tokio::test]
async fn test_second_failure_surfaces_raw_output() {
    let llm = ScriptedLlm::new(&["nope", "still nope"]);
    let err = planner(llm.clone())
        .create_plan("anything", &ctx(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Planning { .. }));
    let raw = err.raw_output().unwrap();
    assert!(raw.contains("nope"));
    assert!(raw.contains("still nope"));
    assert_eq!(llm.prompt_count(), 2);
}

#[tokio::test]
async fn test_backend_failure_is_reasoning_unavailable() {
    let llm = ScriptedLlm::new(&[]);
    let err = planner(llm)
        .create_plan("anything", &ctx(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReasoningUnavailable(_)));
}

#[tokio::test]
async fn test_workflow_plan_parses_dependencies() {
    let llm = ScriptedLlm::new(&[r#"{"nodes": [
        {"id": "a", "agentName": "echo", "arguments": {}, "dependencies": []},
        {"id": "b", "agentName": "echo", "arguments": {}, "dependsOn": ["a"]}
    ]}"#]);
    let nodes = planner(llm)
        .create_workflow("two steps", &ctx(json!({})))
        .await
        .unwrap();

    assert_eq!(nodes.len(), 2);
    assert!(nodes[0].dependencies.is_empty());
    assert!(nodes[1].dependencies.contains("a"));
}

#[tokio::test]
async fn test_llm_advisor_verdict() {
    let llm = ScriptedLlm::new(&[
        r#"{"action": "RETRY_WITH_FIX", "justification": "wrong path", "modifiedArguments": {"path": "/tmp"}}"#,
    ]);
    let advisor = LlmRemediationAdvisor::new(llm.clone());
    let plan = advisor
        .advise("read", &ctx(json!({"path": "/nope"})), "No such file")
        .await
        .unwrap();

    assert_eq!(plan.action, RemediationAction::RetryWithFix);
    assert_eq!(plan.justification, "wrong path");
    assert_eq!(
        plan.modified_arguments.unwrap().get("path"),
        Some(&json!("/tmp"))
    );
    let prompt = llm.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("No such file"));
    assert!(prompt.contains("/nope"));
}

#[tokio::test]
async fn test_advisor_ignores_bracketed_prose_after_verdict() {
    let llm = ScriptedLlm::new(&[
        "{\"action\": \"FAIL_GRACEFULLY\", \"justification\": \"needs a human\"}\nSee the runbook [section 4] {ops}.",
    ]);
    let plan = LlmRemediationAdvisor::new(llm)
        .advise("deploy", &ctx(json!({})), "permission denied")
        .await
        .unwrap();

    assert_eq!(plan.action, RemediationAction::FailGracefully);
    assert_eq!(plan.justification, "needs a human");
}

#[tokio::test]
async fn test_executor_remediates_through_reasoning_backend() {
    let reader = Arc::new(FnCapability::new("read", |input, _| {
        match input.get("path").and_then(|p| p.as_str()) {
            Some("/tmp") => Ok(StepResult::success("read", "read /tmp").with_detail("bytes", 4)),
            other => anyhow::bail!("No such file: {:?}", other),
        }
    }));
    let llm = ScriptedLlm::new(&[
        r#"{"action": "retry", "reason": "use the temp dir", "arguments": {"path": "/tmp"}}"#,
    ]);
    let executor = SequentialExecutor::new(
        registry(vec![reader.clone()]),
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(LlmRemediationAdvisor::new(llm.clone())),
    );

    let report = executor
        .submit(
            vec![PlanStep::new("read").with_arguments(ctx(json!({"path": "/nope"})))],
            ctx(json!({})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.context.get("bytes"), Some(&json!(4)));
    assert_eq!(reader.call_count(), 2);
    assert_eq!(llm.prompt_count(), 1);
}

#[tokio::test]
async fn test_unparseable_verdict_fails_execution() {
    let broken = Arc::new(FnCapability::failing("broken"));
    let llm = ScriptedLlm::new(&["I am not sure what to do here."]);
    let store = Arc::new(MemoryExecutionStore::new());
    let executor = SequentialExecutor::new(
        registry(vec![broken]),
        store.clone(),
        Arc::new(LlmRemediationAdvisor::new(llm)),
    );

    let err = executor
        .submit(vec![PlanStep::new("broken")], ctx(json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Planning { .. }));

    let stored = store.list().await.unwrap().pop().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
}
