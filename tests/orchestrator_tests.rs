use async_trait::async_trait;
use flowllm::engine::FlowEngine;
use flowllm::error::EngineError;
use flowllm::gateway::{
    CompletionRequest, CompletionResponse, ContentBlock, GatewayError, GatewayRouter, LlmGateway,
    StopReason, TokenUsage,
};
use flowllm::model::{
    AgentRecord, ExecutionMode, ExecutionStatus, InterfaceKind, RetryConfig, StepKind, TriggerKind,
};
use flowllm::store::{NewAgent, NewWorkflow, NewWorkflowStep, Store};
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plays back a scripted sequence of gateway results and records every
/// request it sees. Once the script runs dry it answers with "done".
struct ScriptedGateway {
    script: Mutex<VecDeque<Result<CompletionResponse, GatewayError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedGateway {
    fn new(script: Vec<Result<CompletionResponse, GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn text(text: &str) -> Result<CompletionResponse, GatewayError> {
        Ok(CompletionResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            },
        })
    }

    fn transient() -> Result<CompletionResponse, GatewayError> {
        Err(GatewayError::Transient("connection reset".into()))
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::text("done"))
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

async fn engine_with(gateway: Arc<dyn LlmGateway>) -> FlowEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Store::open_in_memory().await.unwrap();
    let mut router = GatewayRouter::new();
    router.register(gateway);
    FlowEngine::new(store, router).await
}

async fn make_agent(engine: &FlowEngine, name: &str) -> AgentRecord {
    engine
        .create_agent(NewAgent {
            name: name.into(),
            provider: "mock".into(),
            model: "test-model".into(),
            system_prompt: "You are a workflow step.".into(),
            temperature: 0.2,
            max_tokens: 512,
            config: json!({}),
        })
        .await
        .unwrap()
}

fn workflow(name: &str, mode: ExecutionMode) -> NewWorkflow {
    NewWorkflow {
        name: name.into(),
        description: String::new(),
        trigger_kind: TriggerKind::Manual,
        trigger_config: json!({}),
        execution_mode: mode,
        input_schema: json!({}),
        interface_kind: InterfaceKind::Api,
        public: false,
    }
}

fn agent_step(
    order: i64,
    agent_id: i64,
    output: Option<&str>,
    depends_on: Vec<i64>,
    input_mapping: JsonValue,
) -> NewWorkflowStep {
    NewWorkflowStep {
        step_order: order,
        kind: StepKind::AgentExecution,
        name: format!("step-{}", order),
        agent_id: Some(agent_id),
        input_mapping,
        output_variable: output.map(|s| s.to_string()),
        condition_expression: None,
        depends_on,
        approval_config: None,
        retry_config: None,
        timeout_seconds: 300,
    }
}

#[tokio::test]
async fn linear_two_step_pipes_output_forward() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::text("hello"),
        ScriptedGateway::text("got: hello"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "writer").await;

    let (wf, _) = engine
        .create_workflow(
            workflow("linear", ExecutionMode::Sync),
            vec![
                agent_step(1, agent.id, Some("s1"), vec![], json!({"task": "greet"})),
                agent_step(
                    2,
                    agent.id,
                    Some("s2"),
                    vec![1],
                    json!({"prev": "${s1.text}"}),
                ),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["s2"]["text"], json!("got: hello"));

    // Step 2's seed message must carry step 1's substituted output.
    assert_eq!(gateway.calls(), 2);
    let second = gateway.request(1);
    let seed = match &second.messages[0].content[0] {
        ContentBlock::Text { text } => text.clone(),
        other => panic!("unexpected seed block {:?}", other),
    };
    assert!(seed.contains("\"prev\":\"hello\""), "seed was {}", seed);
}

#[tokio::test]
async fn false_condition_skips_the_step() {
    let gateway = ScriptedGateway::new(vec![ScriptedGateway::text("hello")]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "writer").await;

    let mut gated = agent_step(2, agent.id, Some("s2"), vec![], json!({}));
    gated.condition_expression = Some("${s1.text} != \"hello\"".into());
    gated.depends_on = vec![1];

    let (wf, _) = engine
        .create_workflow(
            workflow("conditional", ExecutionMode::Sync),
            vec![
                agent_step(1, agent.id, Some("s1"), vec![], json!({})),
                gated,
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["meta"]["steps"]["2"], json!("SKIPPED"));
    assert!(outcome.context.get("s2").is_none());
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn transient_failures_are_absorbed_within_a_turn() {
    // Two transient failures then success: the in-turn retry budget
    // absorbs them without a second step attempt.
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
        ScriptedGateway::text("ok"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "flaky").await;

    let mut step = agent_step(1, agent.id, Some("s1"), vec![], json!({}));
    step.retry_config = Some(RetryConfig {
        max_retries: 2,
        initial_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: None,
    });

    let (wf, _) = engine
        .create_workflow(workflow("retry", ExecutionMode::Sync), vec![step])
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["s1"]["text"], json!("ok"));
    assert_eq!(gateway.calls(), 3);

    let runs = engine.agent_executions_for(outcome.execution_id).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn deep_transients_trigger_the_step_retry_policy() {
    // Three consecutive transients exhaust the in-turn budget and fail
    // the first step attempt; the step retry policy runs a second one.
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
        ScriptedGateway::text("recovered"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "flaky").await;

    let mut step = agent_step(1, agent.id, Some("s1"), vec![], json!({}));
    step.retry_config = Some(RetryConfig {
        max_retries: 2,
        initial_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: None,
    });

    let (wf, _) = engine
        .create_workflow(workflow("deep-retry", ExecutionMode::Sync), vec![step])
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["s1"]["text"], json!("recovered"));
    assert_eq!(gateway.calls(), 4);

    let runs = engine.agent_executions_for(outcome.execution_id).await.unwrap();
    assert_eq!(runs.len(), 2);
    let completed = runs
        .iter()
        .filter(|r| r.status == flowllm::model::AgentRunStatus::Completed)
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn retries_are_bounded_by_the_policy() {
    // Persistent transients with maxRetries = 0: exactly one step
    // attempt (three gateway calls from the in-turn budget), then FAILED.
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
        ScriptedGateway::transient(),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "flaky").await;

    let (wf, _) = engine
        .create_workflow(
            workflow("no-retry", ExecutionMode::Sync),
            vec![agent_step(1, agent.id, Some("s1"), vec![], json!({}))],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error.unwrap().contains("Transient"));
    assert_eq!(gateway.calls(), 3);

    let runs = engine.agent_executions_for(outcome.execution_id).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn dependents_start_after_their_dependencies_complete() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::text("a"),
        ScriptedGateway::text("b"),
        ScriptedGateway::text("c"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "worker").await;

    let (wf, steps) = engine
        .create_workflow(
            workflow("fan-in", ExecutionMode::Sync),
            vec![
                agent_step(1, agent.id, Some("left"), vec![], json!({})),
                agent_step(2, agent.id, Some("right"), vec![], json!({})),
                agent_step(
                    3,
                    agent.id,
                    Some("merged"),
                    vec![1, 2],
                    json!({"l": "${left.text}", "r": "${right.text}"}),
                ),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let runs = engine.agent_executions_for(outcome.execution_id).await.unwrap();
    assert_eq!(runs.len(), 3);
    let step3_id = steps.iter().find(|s| s.step_order == 3).unwrap().id;
    let merged = runs
        .iter()
        .find(|r| r.workflow_step_id == Some(step3_id))
        .unwrap();
    for upstream in runs.iter().filter(|r| r.workflow_step_id != Some(step3_id)) {
        assert!(merged.started_at.unwrap() >= upstream.completed_at.unwrap());
    }
}

#[tokio::test]
async fn condition_steps_record_their_verdict_without_gating() {
    let gateway = ScriptedGateway::new(vec![ScriptedGateway::text("ran")]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "worker").await;

    let verdict = NewWorkflowStep {
        step_order: 1,
        kind: StepKind::Condition,
        name: "gate".into(),
        agent_id: None,
        input_mapping: json!({}),
        output_variable: Some("gate".into()),
        condition_expression: Some("${trigger.n} > 1".into()),
        depends_on: vec![],
        approval_config: None,
        retry_config: None,
        timeout_seconds: 300,
    };

    let mut follower = agent_step(2, agent.id, Some("s2"), vec![1], json!({}));
    follower.condition_expression = Some("${gate} == true".into());

    let (wf, _) = engine
        .create_workflow(workflow("verdicts", ExecutionMode::Sync), vec![verdict, follower])
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({"n": 5})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["gate"], json!(true));
    assert_eq!(outcome.context["s2"]["text"], json!("ran"));
}

#[tokio::test]
async fn parallel_marker_fans_out_dependents() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::text("a"),
        ScriptedGateway::text("b"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "worker").await;

    let marker = NewWorkflowStep {
        step_order: 1,
        kind: StepKind::Parallel,
        name: "fan-out".into(),
        agent_id: None,
        input_mapping: json!({}),
        output_variable: None,
        condition_expression: None,
        depends_on: vec![],
        approval_config: None,
        retry_config: None,
        timeout_seconds: 300,
    };

    let (wf, _) = engine
        .create_workflow(
            workflow("fan-out", ExecutionMode::Sync),
            vec![
                marker,
                agent_step(2, agent.id, Some("a"), vec![1], json!({})),
                agent_step(3, agent.id, Some("b"), vec![1], json!({})),
            ],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context["meta"]["steps"]["1"], json!("COMPLETED"));
    assert!(outcome.context.get("a").is_some());
    assert!(outcome.context.get("b").is_some());
}

#[tokio::test]
async fn invalid_graphs_are_rejected_at_create_time() {
    let gateway = ScriptedGateway::new(vec![]);
    let engine = engine_with(gateway).await;
    let agent = make_agent(&engine, "worker").await;

    // Dependency cycle.
    let result = engine
        .create_workflow(
            workflow("cyclic", ExecutionMode::Sync),
            vec![
                agent_step(1, agent.id, None, vec![2], json!({})),
                agent_step(2, agent.id, None, vec![1], json!({})),
            ],
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    // Two concurrent writers of the same output key.
    let result = engine
        .create_workflow(
            workflow("collision", ExecutionMode::Sync),
            vec![
                agent_step(1, agent.id, Some("out"), vec![], json!({})),
                agent_step(2, agent.id, Some("out"), vec![], json!({})),
            ],
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    // Unknown dependency reference.
    let result = engine
        .create_workflow(
            workflow("dangling", ExecutionMode::Sync),
            vec![agent_step(1, agent.id, None, vec![7], json!({}))],
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn inactive_workflows_refuse_to_run() {
    let gateway = ScriptedGateway::new(vec![]);
    let engine = engine_with(gateway).await;
    let agent = make_agent(&engine, "worker").await;

    let (wf, _) = engine
        .create_workflow(
            workflow("dormant", ExecutionMode::Sync),
            vec![agent_step(1, agent.id, None, vec![], json!({}))],
        )
        .await
        .unwrap();
    engine.deactivate_workflow(wf.id).await.unwrap();

    let result = engine.execute_workflow(wf.id, json!({})).await;
    assert!(matches!(result, Err(EngineError::WorkflowInactive(_))));
}

#[tokio::test]
async fn public_gating_rejects_private_workflows() {
    let gateway = ScriptedGateway::new(vec![ScriptedGateway::text("ok")]);
    let engine = engine_with(gateway).await;
    let agent = make_agent(&engine, "worker").await;

    let (private_wf, _) = engine
        .create_workflow(
            workflow("private", ExecutionMode::Sync),
            vec![agent_step(1, agent.id, None, vec![], json!({}))],
        )
        .await
        .unwrap();
    let result = engine.execute_public_workflow(private_wf.id, json!({})).await;
    assert!(matches!(result, Err(EngineError::NotPublic(_))));

    let mut public_wf = workflow("public", ExecutionMode::Sync);
    public_wf.public = true;
    public_wf.input_schema = json!({
        "type": "object",
        "properties": {"n": {"type": "integer"}},
        "required": ["n"]
    });
    let (public_wf, _) = engine
        .create_workflow(
            public_wf,
            vec![agent_step(1, agent.id, None, vec![], json!({}))],
        )
        .await
        .unwrap();

    // Schema violations surface before anything runs.
    let result = engine
        .execute_public_workflow(public_wf.id, json!({"n": "three"}))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let outcome = engine
        .execute_public_workflow(public_wf.id, json!({"n": 3}))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn async_mode_returns_before_the_run_finishes() {
    let gateway = ScriptedGateway::new(vec![ScriptedGateway::text("ok")]);
    let engine = engine_with(gateway).await;
    let agent = make_agent(&engine, "worker").await;

    let (wf, _) = engine
        .create_workflow(
            workflow("background", ExecutionMode::Async),
            vec![agent_step(1, agent.id, Some("s1"), vec![], json!({}))],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    assert!(outcome.success);
    assert!(!outcome.status.is_terminal());

    let final_outcome = wait_for_terminal(&engine, outcome.execution_id).await;
    assert_eq!(final_outcome.status, ExecutionStatus::Completed);
    assert_eq!(final_outcome.context["s1"]["text"], json!("ok"));
}

/// Gateway that hangs long enough for a cancellation to land first.
struct SlowGateway;

#[async_trait]
impl LlmGateway for SlowGateway {
    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ScriptedGateway::text("late")
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

#[tokio::test]
async fn cancellation_reaches_terminal_state_promptly() {
    let engine = engine_with(Arc::new(SlowGateway)).await;
    let agent = make_agent(&engine, "slowpoke").await;

    let (wf, _) = engine
        .create_workflow(
            workflow("cancellable", ExecutionMode::Async),
            vec![agent_step(1, agent.id, Some("s1"), vec![], json!({}))],
        )
        .await
        .unwrap();

    let outcome = engine.execute_workflow(wf.id, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel_execution(outcome.execution_id).await.unwrap();

    let final_outcome = wait_for_terminal(&engine, outcome.execution_id).await;
    assert_eq!(final_outcome.status, ExecutionStatus::Cancelled);
}

async fn wait_for_terminal(
    engine: &FlowEngine,
    execution_id: i64,
) -> flowllm::orchestrator::ExecutionOutcome {
    for _ in 0..100 {
        let outcome = engine.execution_outcome(execution_id).await.unwrap();
        if outcome.status.is_terminal() {
            return outcome;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {} never reached a terminal state", execution_id);
}
