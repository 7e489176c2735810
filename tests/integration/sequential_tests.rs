use super::common::*;
use planwright::capability::{ResultStatus, StepResult};
use planwright::execution::{ExecutionEvent, SequentialExecutor};
use planwright::persistence::{ExecutionStatus, ExecutionStore, MemoryExecutionStore};
use planwright::planning::{FailFastAdvisor, PlanStep, RemediationPlan};
use planwright::EngineError;
use serde_json::{json, Value};
use std::sync::Arc;

fn executor(
    capabilities: Vec<Arc<FnCapability>>,
    advisor: Arc<dyn planwright::planning::RemediationAdvisor>,
) -> (SequentialExecutor, Arc<MemoryExecutionStore>) {
    let store = Arc::new(MemoryExecutionStore::new());
    let executor = SequentialExecutor::new(registry(capabilities), store.clone(), advisor);
    (executor, store)
}

#[tokio::test]
async fn test_steps_run_in_order_and_merge_context() {
    let first = Arc::new(FnCapability::returning("first", json!({"shared": 1, "a": true})));
    let second = Arc::new(FnCapability::returning("second", json!({"shared": 2})));
    let third = Arc::new(FnCapability::new("third", |input, _| {
        // Sees everything merged so far
        let seen = input.get("shared").cloned().unwrap_or(Value::Null);
        Ok(StepResult::success("third", "ok").with_detail("seen", seen))
    }));
    let (executor, store) = executor(
        vec![first.clone(), second.clone(), third.clone()],
        Arc::new(FailFastAdvisor),
    );

    let report = executor
        .submit(
            vec![
                PlanStep::new("first"),
                PlanStep::new("second"),
                PlanStep::new("third"),
            ],
            ctx(json!({"x": 1})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.current_step_index, 3);
    let agents: Vec<_> = report.results.iter().map(|r| r.agent_name.as_str()).collect();
    assert_eq!(agents, vec!["first", "second", "third"]);
    assert_eq!(
        Value::Object(report.context.clone()),
        json!({"x": 1, "shared": 2, "a": true, "seen": 2})
    );

    let stored = store.load(&report.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert_eq!(stored.execution_history, report.results);
}

#[tokio::test]
async fn test_step_arguments_overlay_context() {
    let probe = Arc::new(FnCapability::returning("probe", json!({})));
    let (executor, _) = executor(vec![probe.clone()], Arc::new(FailFastAdvisor));

    executor
        .submit(
            vec![PlanStep::new("probe").with_arguments(ctx(json!({"path": "b"})))],
            ctx(json!({"path": "a", "mode": "fast"})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        Value::Object(probe.calls()[0].clone()),
        json!({"path": "b", "mode": "fast"})
    );
}

#[tokio::test]
async fn test_empty_plan_completes_immediately() {
    let (executor, _) = executor(vec![], Arc::new(FailFastAdvisor));
    let report = executor
        .submit(vec![], ctx(json!({"x": 1})), None)
        .await
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.current_step_index, 0);
    assert!(report.results.is_empty());
}

#[tokio::test]
async fn test_approval_gate_suspends_then_resumes() {
    let a = Arc::new(FnCapability::returning("A", json!({"a": 1})));
    let b = Arc::new(FnCapability::returning("B", json!({"b": 2})).gated());
    let c = Arc::new(FnCapability::returning("C", json!({"c": 3})));
    let (executor, store) = executor(
        vec![a.clone(), b.clone(), c.clone()],
        Arc::new(FailFastAdvisor),
    );
    let plan = vec![PlanStep::new("A"), PlanStep::new("B"), PlanStep::new("C")];

    let suspended = executor
        .submit(plan, ctx(json!({"x": 1})), Some("session-1".into()))
        .await
        .unwrap();

    assert_eq!(suspended.status, ExecutionStatus::PendingApproval);
    assert_eq!(suspended.current_step_index, 1);
    assert_eq!(suspended.results.len(), 2);
    assert_eq!(suspended.results[1].status, ResultStatus::ApprovalRequired);
    assert_eq!(b.call_count(), 0);
    assert_eq!(c.call_count(), 0);
    // The gate marker does not leak into the context
    assert_eq!(
        Value::Object(suspended.context.clone()),
        json!({"x": 1, "a": 1})
    );

    let stored = store.load(&suspended.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::PendingApproval);
    assert_eq!(stored.session_id.as_deref(), Some("session-1"));

    let done = executor.resume(&suspended.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.current_step_index, 3);
    assert_eq!(
        Value::Object(done.context.clone()),
        json!({"x": 1, "a": 1, "b": 2, "c": 3})
    );

    let statuses: Vec<_> = done.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ResultStatus::Success,
            ResultStatus::ApprovalRequired,
            ResultStatus::Success,
            ResultStatus::Success,
        ]
    );
    // Gate sits immediately before the gated step's own result
    assert_eq!(done.results[1].agent_name, "B");
    assert_eq!(done.results[2].agent_name, "B");
    assert_eq!(done.real_results().len(), 3);
    assert_eq!(b.call_count(), 1);
}

#[tokio::test]
async fn test_resumed_run_matches_ungated_run() {
    let build = |gated: bool| {
        let b = FnCapability::returning("B", json!({"b": 2, "x": 5}));
        vec![
            Arc::new(FnCapability::returning("A", json!({"a": 1}))),
            Arc::new(if gated { b.gated() } else { b }),
            Arc::new(FnCapability::returning("C", json!({"c": 3}))),
        ]
    };
    let plan = || vec![PlanStep::new("A"), PlanStep::new("B"), PlanStep::new("C")];

    let (ungated, _) = executor(build(false), Arc::new(FailFastAdvisor));
    let direct = ungated
        .submit(plan(), ctx(json!({"x": 1})), None)
        .await
        .unwrap();

    let (gated, _) = executor(build(true), Arc::new(FailFastAdvisor));
    let suspended = gated
        .submit(plan(), ctx(json!({"x": 1})), None)
        .await
        .unwrap();
    let resumed = gated.resume(&suspended.execution_id).await.unwrap();

    assert_eq!(resumed.context, direct.context);
    assert_eq!(resumed.real_results(), direct.real_results());
}

#[tokio::test]
async fn test_failures_beyond_budget_fail_execution() {
    let flaky = Arc::new(FnCapability::failing("flaky"));
    let later = Arc::new(FnCapability::returning("later", json!({})));
    let advisor = ScriptedAdvisor::new(vec![
        RemediationPlan::retry_with("again", ctx(json!({"n": 1}))),
        RemediationPlan::retry_with("again", ctx(json!({"n": 2}))),
        RemediationPlan::retry_with("again", ctx(json!({"n": 3}))),
    ]);
    let (executor, store) = executor(vec![flaky.clone(), later.clone()], advisor.clone());

    let err = executor
        .submit(
            vec![PlanStep::new("flaky"), PlanStep::new("later")],
            ctx(json!({})),
            None,
        )
        .await
        .unwrap_err();

    match &err {
        EngineError::RecoveryBudgetExhausted { agent, attempts, .. } => {
            assert_eq!(agent, "flaky");
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(advisor.call_count(), 2);
    assert_eq!(later.call_count(), 0);

    let stored = store.list().await.unwrap().pop().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert_eq!(stored.current_step_index, 0);
    assert_eq!(stored.execution_history.len(), 3);
    assert!(stored
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("Recovery budget exhausted"));
}

#[tokio::test]
async fn test_retry_with_fix_reruns_once_with_new_arguments() {
    let picky = Arc::new(FnCapability::new("picky", |input, _| {
        if input.get("fixed") == Some(&json!(true)) {
            Ok(StepResult::success("picky", "fixed").with_detail("done", true))
        } else {
            anyhow::bail!("missing 'fixed' flag")
        }
    }));
    let advisor = ScriptedAdvisor::new(vec![RemediationPlan::retry_with(
        "set the flag",
        ctx(json!({"fixed": true})),
    )]);
    let (executor, store) = executor(vec![picky.clone()], advisor.clone());

    let report = executor
        .submit(
            vec![PlanStep::new("picky").with_arguments(ctx(json!({"fixed": false})))],
            ctx(json!({})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(picky.call_count(), 2);
    assert_eq!(picky.calls()[1].get("fixed"), Some(&json!(true)));
    assert_eq!(advisor.call_count(), 1);

    let (agent, arguments, error) = advisor.calls.lock().unwrap()[0].clone();
    assert_eq!(agent, "picky");
    assert_eq!(arguments.get("fixed"), Some(&json!(false)));
    assert!(error.contains("missing 'fixed' flag"));

    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![ResultStatus::Failure, ResultStatus::Success]);

    let stored = store.load(&report.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.plan_steps[0].arguments.get("fixed"), Some(&json!(true)));
    assert_eq!(stored.recovery_attempts, 0);
}

#[tokio::test]
async fn test_fail_gracefully_keeps_failure_details_out_of_context() {
    let leaky = Arc::new(FnCapability::new("leaky", |_, _| {
        Ok(StepResult::failure("leaky", "nope").with_detail("leak", 1))
    }));
    let advisor = ScriptedAdvisor::new(vec![RemediationPlan::fail("not recoverable")]);
    let (executor, store) = executor(vec![leaky], advisor);

    let err = executor
        .submit(vec![PlanStep::new("leaky")], ctx(json!({"x": 1})), None)
        .await
        .unwrap_err();

    match err {
        EngineError::RemediationAbandoned { justification, .. } => {
            assert_eq!(justification, "not recoverable")
        }
        other => panic!("unexpected error: {}", other),
    }

    let stored = store.list().await.unwrap().pop().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert!(!stored.accumulated_context.contains_key("leak"));
    assert_eq!(stored.execution_history[0].status, ResultStatus::Failure);
}

#[tokio::test]
async fn test_resume_on_completed_is_idempotent() {
    let once = Arc::new(FnCapability::returning("once", json!({"v": 1})));
    let (executor, _) = executor(vec![once.clone()], Arc::new(FailFastAdvisor));

    let report = executor
        .submit(vec![PlanStep::new("once")], ctx(json!({})), None)
        .await
        .unwrap();

    let again = executor.resume(&report.execution_id).await.unwrap();
    let third = executor.resume(&report.execution_id).await.unwrap();
    assert_eq!(again, report);
    assert_eq!(third, report);
    assert_eq!(once.call_count(), 1);
}

#[tokio::test]
async fn test_events_follow_state_transitions() {
    let a = Arc::new(FnCapability::returning("A", json!({})));
    let b = Arc::new(FnCapability::returning("B", json!({})).gated());
    let (executor, _) = executor(vec![a, b], Arc::new(FailFastAdvisor));
    let mut events = executor.subscribe();

    let report = executor
        .submit(vec![PlanStep::new("A"), PlanStep::new("B")], ctx(json!({})), None)
        .await
        .unwrap();
    executor.resume(&report.execution_id).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id(), report.execution_id);
        kinds.push(match event {
            ExecutionEvent::Started { .. } => "started",
            ExecutionEvent::StepStarted { .. } => "step_started",
            ExecutionEvent::StepCompleted { .. } => "step_completed",
            ExecutionEvent::ApprovalRequired { .. } => "approval_required",
            ExecutionEvent::Completed { .. } => "completed",
            _ => "other",
        });
    }

    assert_eq!(
        kinds,
        vec![
            "started",
            "step_started",
            "step_completed",
            "approval_required",
            "step_started",
            "step_completed",
            "completed",
        ]
    );
}
