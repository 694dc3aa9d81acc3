use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use flowllm::engine::FlowEngine;
use flowllm::error::EngineError;
use flowllm::gateway::{
    CompletionRequest, CompletionResponse, ContentBlock, GatewayError, GatewayRouter, LlmGateway,
    StopReason, TokenUsage,
};
use flowllm::model::{
    AgentRecord, ApprovalConfig, ApprovalStatus, ExecutionMode, ExecutionStatus, InterfaceKind,
    StepKind, TriggerKind,
};
use flowllm::store::{NewAgent, NewWorkflow, NewWorkflowStep, Store};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// Always answers with the same text; approval flows only need the agent
/// steps around the gate to succeed.
struct FixedGateway {
    reply: String,
}

#[async_trait]
impl LlmGateway for FixedGateway {
    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        Ok(CompletionResponse {
            content: vec![ContentBlock::Text {
                text: self.reply.clone(),
            }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 2,
                output_tokens: 2,
            },
        })
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

async fn engine() -> FlowEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Store::open_in_memory().await.unwrap();
    let mut router = GatewayRouter::new();
    router.register(Arc::new(FixedGateway {
        reply: "proceeding".into(),
    }));
    FlowEngine::new(store, router).await
}

async fn make_agent(engine: &FlowEngine) -> AgentRecord {
    engine
        .create_agent(NewAgent {
            name: "executor".into(),
            provider: "mock".into(),
            model: "test-model".into(),
            system_prompt: "Carry out the approved action.".into(),
            temperature: 0.0,
            max_tokens: 256,
            config: json!({}),
        })
        .await
        .unwrap()
}

fn approval_step(order: i64, role: &str, timeout_minutes: i64) -> NewWorkflowStep {
    NewWorkflowStep {
        step_order: order,
        kind: StepKind::Approval,
        name: format!("gate-{}", order),
        agent_id: None,
        input_mapping: json!({}),
        output_variable: None,
        condition_expression: None,
        depends_on: vec![],
        approval_config: Some(ApprovalConfig {
            required_role: Some(role.into()),
            timeout_minutes: Some(timeout_minutes),
        }),
        retry_config: None,
        timeout_seconds: 300,
    }
}

fn agent_step(order: i64, agent_id: i64, depends_on: Vec<i64>, input: JsonValue) -> NewWorkflowStep {
    NewWorkflowStep {
        step_order: order,
        kind: StepKind::AgentExecution,
        name: format!("step-{}", order),
        agent_id: Some(agent_id),
        input_mapping: input,
        output_variable: None,
        condition_expression: None,
        depends_on,
        approval_config: None,
        retry_config: None,
        timeout_seconds: 300,
    }
}

fn gated_workflow(name: &str) -> NewWorkflow {
    NewWorkflow {
        name: name.into(),
        description: String::new(),
        trigger_kind: TriggerKind::Manual,
        trigger_config: json!({}),
        execution_mode: ExecutionMode::Sync,
        input_schema: json!({}),
        interface_kind: InterfaceKind::Form,
        public: false,
    }
}

#[tokio::test]
async fn approving_resumes_and_completes_the_execution() {
    let engine = engine().await;
    let agent = make_agent(&engine).await;

    let (wf, _) = engine
        .create_workflow(
            gated_workflow("gated"),
            vec![
                approval_step(1, "manager", 30),
                agent_step(2, agent.id, vec![1], json!({})),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::AwaitingApproval);

    let pending = engine.list_pending_approvals(Some("manager")).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(engine.count_pending_approvals().await.unwrap(), 1);

    engine
        .approve(pending[0].id, "alice", Some("ok"))
        .await
        .unwrap();

    let finished = engine.execution_outcome(outcome.execution_id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.context["approval1"],
        json!({"approved": true, "approvedBy": "alice", "comments": "ok"})
    );
    assert_eq!(finished.context["step2"]["text"], json!("proceeding"));

    let request = engine.approvals().get(pending[0].id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert!(request.resolved_at.is_some());
    assert_eq!(request.resolved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn rejection_skips_the_gate_and_continues() {
    let engine = engine().await;
    let agent = make_agent(&engine).await;

    let (wf, _) = engine
        .create_workflow(
            gated_workflow("gated-reject"),
            vec![
                approval_step(1, "manager", 30),
                agent_step(2, agent.id, vec![1], json!({})),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    let pending = engine.list_pending_approvals(None).await.unwrap();
    engine
        .reject(pending[0].id, "bob", Some("not now"))
        .await
        .unwrap();

    let finished = engine.execution_outcome(outcome.execution_id).await.unwrap();
    // Rejection does not abort the workflow: the gate is observed as
    // SKIPPED and dependents still run.
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.context["meta"]["steps"]["1"], json!("SKIPPED"));
    assert_eq!(finished.context["approval1"]["approved"], json!(false));
    assert_eq!(finished.context["step2"]["text"], json!("proceeding"));
}

#[tokio::test]
async fn a_request_resolves_exactly_once() {
    let engine = engine().await;
    let agent = make_agent(&engine).await;

    let (wf, _) = engine
        .create_workflow(
            gated_workflow("gated-once"),
            vec![
                approval_step(1, "manager", 30),
                agent_step(2, agent.id, vec![1], json!({})),
            ],
        )
        .await
        .unwrap();

    engine.execute_workflow(wf.id, json!({})).await.unwrap();
    let pending = engine.list_pending_approvals(None).await.unwrap();
    let id = pending[0].id;

    engine.approve(id, "alice", None).await.unwrap();
    assert!(matches!(
        engine.approve(id, "mallory", None).await,
        Err(EngineError::AlreadyResolved(_))
    ));
    assert!(matches!(
        engine.reject(id, "mallory", None).await,
        Err(EngineError::AlreadyResolved(_))
    ));

    let request = engine.approvals().get(id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(request.resolved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn timed_out_approvals_resume_as_rejected() {
    let engine = engine().await;
    let agent = make_agent(&engine).await;

    let (wf, _) = engine
        .create_workflow(
            gated_workflow("gated-timeout"),
            vec![
                approval_step(1, "manager", 1),
                agent_step(2, agent.id, vec![1], json!({})),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::AwaitingApproval);
    let pending = engine.list_pending_approvals(None).await.unwrap();

    // Two minutes later the sweeper times the request out.
    let swept = engine
        .approvals()
        .sweep_timeouts_at(Utc::now() + ChronoDuration::minutes(2))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let request = engine.approvals().get(pending[0].id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Timeout);

    let finished = engine.execution_outcome(outcome.execution_id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.context["meta"]["steps"]["1"], json!("SKIPPED"));
    assert_eq!(finished.context["approval1"]["comments"], json!("timeout"));
    assert_eq!(finished.context["step2"]["text"], json!("proceeding"));

    // Nothing left to sweep.
    let swept = engine
        .approvals()
        .sweep_timeouts_at(Utc::now() + ChronoDuration::minutes(5))
        .await
        .unwrap();
    assert_eq!(swept, 0);
}

#[tokio::test]
async fn pending_listing_filters_by_role() {
    let engine = engine().await;
    let agent = make_agent(&engine).await;

    let (wf, _) = engine
        .create_workflow(
            gated_workflow("two-gates"),
            vec![
                approval_step(1, "manager", 30),
                {
                    let mut step = approval_step(2, "finance", 30);
                    step.depends_on = vec![];
                    step
                },
                agent_step(3, agent.id, vec![1, 2], json!({})),
            ],
        )
        .await
        .unwrap();

    engine.execute_workflow(wf.id, json!({})).await.unwrap();

    assert_eq!(engine.count_pending_approvals().await.unwrap(), 2);
    let managers = engine.list_pending_approvals(Some("manager")).await.unwrap();
    assert_eq!(managers.len(), 1);
    assert_eq!(managers[0].required_role.as_deref(), Some("manager"));
    let finance = engine.list_pending_approvals(Some("finance")).await.unwrap();
    assert_eq!(finance.len(), 1);
}
