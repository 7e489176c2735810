use super::common::*;
use planwright::capability::ResultStatus;
use planwright::config::ExecutionConfig;
use planwright::execution::{Engine, ExecutionEvent};
use planwright::persistence::{ExecutionStatus, ExecutionStore, MemoryExecutionStore};
use planwright::planning::{PlanStep, WorkflowNode};
use planwright::EngineError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn engine(capabilities: Vec<Arc<FnCapability>>) -> (Engine, Arc<MemoryExecutionStore>) {
    let store = Arc::new(MemoryExecutionStore::new());
    let engine = Engine::builder(registry(capabilities), store.clone()).build();
    (engine, store)
}

#[tokio::test]
async fn test_submitted_plan_runs_in_background() {
    let a = Arc::new(FnCapability::returning("A", json!({"a": 1})));
    let (engine, _) = engine(vec![a.clone()]);

    let id = engine
        .submit_plan(vec![PlanStep::new("A"), PlanStep::new("A")], ctx(json!({})), None)
        .await
        .unwrap();
    let report = engine.wait(&id).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.current_step_index, 2);
    assert_eq!(a.call_count(), 2);
    assert!(!engine.is_live(&id));
}

#[tokio::test]
async fn test_cancel_interrupts_live_execution() {
    let slow = Arc::new(FnCapability::returning("slow", json!({})).slow(Duration::from_secs(30)));
    let after = Arc::new(FnCapability::returning("after", json!({})));
    let (engine, store) = engine(vec![slow.clone(), after.clone()]);

    let id = engine
        .submit_plan(
            vec![PlanStep::new("slow"), PlanStep::new("after")],
            ctx(json!({})),
            None,
        )
        .await
        .unwrap();
    assert!(engine.is_live(&id));
    assert!(engine.cancel(&id).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(5), engine.wait(&id))
        .await
        .expect("cancelled execution should stop promptly")
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Cancelled);
    assert!(slow.call_count() <= 1);
    assert_eq!(after.call_count(), 0);
    assert_eq!(
        store.load(&id).await.unwrap().unwrap().status,
        ExecutionStatus::Cancelled
    );
    // Nothing left to cancel
    assert!(!engine.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_suspended_execution() {
    let gate = Arc::new(FnCapability::returning("gate", json!({})).gated());
    let (engine, _) = engine(vec![gate.clone()]);

    let report = engine
        .run_plan(vec![PlanStep::new("gate")], ctx(json!({})), None)
        .await
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::PendingApproval);

    assert!(engine.cancel(&report.execution_id).await.unwrap());
    assert_eq!(
        engine.status(&report.execution_id).await.unwrap(),
        ExecutionStatus::Cancelled
    );

    // Resuming a cancelled execution returns it untouched
    let resumed = engine.resume(&report.execution_id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Cancelled);
    assert_eq!(gate.call_count(), 0);
}

#[tokio::test]
async fn test_resume_continues_past_gate() {
    let a = Arc::new(FnCapability::returning("A", json!({"a": 1})));
    let b = Arc::new(FnCapability::returning("B", json!({"b": 2})).gated());
    let c = Arc::new(FnCapability::returning("C", json!({"c": 3})));
    let (engine, _) = engine(vec![a, b, c]);

    let suspended = engine
        .run_plan(
            vec![PlanStep::new("A"), PlanStep::new("B"), PlanStep::new("C")],
            ctx(json!({"x": 1})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(suspended.status, ExecutionStatus::PendingApproval);
    assert!(!engine.is_live(&suspended.execution_id));

    let done = engine.resume(&suspended.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(
        Value::Object(done.context),
        json!({"x": 1, "a": 1, "b": 2, "c": 3})
    );
    assert!(!engine.is_live(&suspended.execution_id));
}

#[tokio::test]
async fn test_resume_rejects_live_execution() {
    let slow = Arc::new(FnCapability::returning("slow", json!({})).slow(Duration::from_secs(30)));
    let (engine, _) = engine(vec![slow]);

    let id = engine
        .submit_plan(vec![PlanStep::new("slow")], ctx(json!({})), None)
        .await
        .unwrap();

    assert!(matches!(
        engine.resume(&id).await,
        Err(EngineError::AlreadyRunning(_))
    ));
    // Observing a live execution must not flag it as orphaned
    assert_eq!(engine.status(&id).await.unwrap(), ExecutionStatus::Running);
    assert!(engine.recover().await.unwrap().is_empty());

    engine.cancel(&id).await.unwrap();
    engine.wait(&id).await.unwrap();
}

#[tokio::test]
async fn test_step_longer_than_live_ttl_is_not_swept() {
    let slow = Arc::new(
        FnCapability::returning("slow", json!({"slept": true})).slow(Duration::from_millis(2500)),
    );
    let store = Arc::new(MemoryExecutionStore::new());
    let engine = Engine::builder(registry(vec![slow.clone()]), store.clone())
        .config(ExecutionConfig {
            live_ttl_secs: 1,
            ..ExecutionConfig::default()
        })
        .build();

    let id = engine
        .submit_plan(vec![PlanStep::new("slow")], ctx(json!({})), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(engine.recover().await.unwrap().is_empty());
    assert_eq!(engine.status(&id).await.unwrap(), ExecutionStatus::Running);

    let report = engine.wait(&id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.failure_reason, None);
    assert_eq!(report.context.get("slept"), Some(&json!(true)));
    assert_eq!(slow.call_count(), 1);
}

#[tokio::test]
async fn test_unknown_execution_is_reported() {
    let (engine, _) = engine(vec![]);
    assert!(matches!(
        engine.status("missing").await,
        Err(EngineError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        engine.resume("missing").await,
        Err(EngineError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn test_workflow_through_engine() {
    let a = Arc::new(FnCapability::returning("A", json!({"a": 1})));
    let b = Arc::new(FnCapability::failing("B"));
    let c = Arc::new(FnCapability::returning("C", json!({"c": 1})));
    let (engine, _) = engine(vec![a, b, c.clone()]);

    let report = engine
        .run_workflow(
            vec![
                WorkflowNode::new("A", "A"),
                WorkflowNode::new("B", "B"),
                WorkflowNode::new("C", "C").depends_on(["A", "B"]),
            ],
            ctx(json!({"x": 1})),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome("C").unwrap().status, ResultStatus::Skipped);
    assert_eq!(c.call_count(), 0);
    assert!(!engine.is_live(&report.workflow_id));
}

#[tokio::test]
async fn test_workflow_with_chosen_id_can_be_cancelled() {
    let slow = Arc::new(FnCapability::returning("slow", json!({})).slow(Duration::from_secs(30)));
    let (engine, _) = engine(vec![slow.clone()]);

    let run = engine.run_workflow_as("wf-nightly", vec![WorkflowNode::new("s", "slow")], ctx(json!({})));
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_live("wf-nightly"));
        engine.cancel("wf-nightly").await.unwrap()
    };
    let (outcome, cancelled) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(run, cancel)
    })
    .await
    .expect("cancelled workflow should stop promptly");

    assert!(cancelled);
    assert!(matches!(outcome, Err(EngineError::Cancelled(id)) if id == "wf-nightly"));
    assert!(!engine.is_live("wf-nightly"));
}

#[tokio::test]
async fn test_invalid_workflow_is_rejected_before_running() {
    let a = Arc::new(FnCapability::returning("A", json!({})));
    let (engine, _) = engine(vec![a.clone()]);

    let err = engine
        .run_workflow(
            vec![
                WorkflowNode::new("x", "A").depends_on(["y"]),
                WorkflowNode::new("y", "A").depends_on(["x"]),
            ],
            ctx(json!({})),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Planning { .. }));
    assert_eq!(a.call_count(), 0);
}

#[tokio::test]
async fn test_workflow_gated_nodes_need_up_front_approval() {
    let deploy = Arc::new(FnCapability::returning("deploy", json!({"deployed": true})).gated());
    let nodes = || vec![WorkflowNode::new("d", "deploy")];

    let (strict, _) = engine(vec![deploy.clone()]);
    let report = strict.run_workflow(nodes(), ctx(json!({}))).await.unwrap();
    assert_eq!(report.outcome("d").unwrap().status, ResultStatus::Failure);
    assert_eq!(deploy.call_count(), 0);

    let approving = Engine::builder(
        registry(vec![deploy.clone()]),
        Arc::new(MemoryExecutionStore::new()),
    )
    .auto_approve_workflows(true)
    .build();
    let report = approving.run_workflow(nodes(), ctx(json!({}))).await.unwrap();
    assert_eq!(report.outcome("d").unwrap().status, ResultStatus::Success);
    assert_eq!(report.context.get("deployed"), Some(&json!(true)));
}

#[tokio::test]
async fn test_goal_is_planned_then_executed() {
    let a = Arc::new(FnCapability::returning("A", json!({"a": 1})));
    let llm = ScriptedLlm::new(&[r#"[{"agentName": "A", "arguments": {"k": "v"}}]"#]);
    let engine = Engine::builder(registry(vec![a.clone()]), Arc::new(MemoryExecutionStore::new()))
        .llm(llm.clone())
        .build();

    let report = engine
        .run_goal("do the A thing", ctx(json!({"x": 1})), None)
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(a.calls()[0].get("k"), Some(&json!("v")));
    assert_eq!(a.calls()[0].get("x"), Some(&json!(1)));
    assert_eq!(llm.prompt_count(), 1);
}

#[tokio::test]
async fn test_engine_broadcasts_events() {
    let a = Arc::new(FnCapability::returning("A", json!({})));
    let (engine, _) = engine(vec![a]);
    let mut events = engine.subscribe();

    let report = engine
        .run_plan(vec![PlanStep::new("A")], ctx(json!({})), None)
        .await
        .unwrap();

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::Completed { execution_id } = event {
            assert_eq!(execution_id, report.execution_id);
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}
