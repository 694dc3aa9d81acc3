use async_trait::async_trait;
use flowllm::dispatcher::ToolHandler;
use flowllm::engine::FlowEngine;
use flowllm::error::EngineError;
use flowllm::gateway::{
    CompletionRequest, CompletionResponse, ContentBlock, GatewayError, GatewayRouter, LlmGateway,
    StopReason, TokenUsage,
};
use flowllm::model::{AgentRecord, ToolKind, ToolRecord};
use flowllm::store::{NewAgent, NewTool, Store};
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};

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

    fn tool_use(id: &str, name: &str, input: JsonValue) -> Result<CompletionResponse, GatewayError> {
        Ok(CompletionResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            },
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    /// The tool_result block carried by the last message of a request.
    fn tool_result_of(&self, index: usize) -> (JsonValue, bool) {
        let request = self.request(index);
        let message = request.messages.last().unwrap();
        match &message.content[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => (content.clone(), *is_error),
            other => panic!("expected a tool_result block, got {:?}", other),
        }
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

struct SkuLookup;

#[async_trait]
impl ToolHandler for SkuLookup {
    async fn execute(&self, input: JsonValue) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let sku = input["sku"].as_str().unwrap_or_default();
        if sku == "BOOM" {
            return Err("inventory backend unavailable".into());
        }
        Ok(json!({"sku": sku, "price": 42}))
    }

    fn validate(&self, input: &JsonValue) -> bool {
        input.get("deny").is_none()
    }
}

async fn engine_with(gateway: Arc<dyn LlmGateway>) -> FlowEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Store::open_in_memory().await.unwrap();
    let mut router = GatewayRouter::new();
    router.register(gateway);
    FlowEngine::new(store, router).await
}

async fn make_agent(engine: &FlowEngine, name: &str, config: JsonValue) -> AgentRecord {
    engine
        .create_agent(NewAgent {
            name: name.into(),
            provider: "mock".into(),
            model: "test-model".into(),
            system_prompt: "Answer using your tools.".into(),
            temperature: 0.1,
            max_tokens: 512,
            config,
        })
        .await
        .unwrap()
}

async fn make_lookup_tool(engine: &FlowEngine, agent_id: i64) -> ToolRecord {
    let tool = engine
        .create_tool(NewTool {
            name: "lookup_sku".into(),
            kind: ToolKind::Builtin,
            description: "Look up a product by SKU.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"sku": {"type": "string"}},
                "required": ["sku"]
            }),
            handler: "sku_lookup".into(),
        })
        .await
        .unwrap();
    engine
        .register_tool_handler("sku_lookup", Arc::new(SkuLookup))
        .await;
    engine
        .bind_tool_to_agent(agent_id, tool.id, None)
        .await
        .unwrap();
    tool
}

#[tokio::test]
async fn tool_calls_round_trip_through_the_loop() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": "A-113"})),
        ScriptedGateway::text("price is 42"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "shopper", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    let outcome = engine
        .execute_agent(agent.id, json!("how much is A-113?"))
        .await
        .unwrap();
    assert_eq!(outcome.text, "price is 42");
    assert_eq!(gateway.calls(), 2);

    // The turn's catalog carried the bound tool.
    let first = gateway.request(0);
    assert_eq!(first.tools.len(), 1);
    assert_eq!(first.tools[0].name, "lookup_sku");

    let (content, is_error) = gateway.tool_result_of(1);
    assert!(!is_error);
    assert_eq!(content, json!({"sku": "A-113", "price": 42}));
}

#[tokio::test]
async fn unknown_tools_surface_as_error_blobs() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "no_such_tool", json!({})),
        ScriptedGateway::text("recovered without the tool"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "optimist", json!({})).await;

    let outcome = engine.execute_agent(agent.id, json!("try it")).await.unwrap();
    assert_eq!(outcome.text, "recovered without the tool");

    let (content, is_error) = gateway.tool_result_of(1);
    assert!(is_error);
    assert!(content["error"].as_str().unwrap().contains("Tool not found"));
}

#[tokio::test]
async fn schema_violations_are_rejected_before_the_handler_runs() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": 5})),
        ScriptedGateway::text("fixed my input"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "sloppy", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    let outcome = engine.execute_agent(agent.id, json!("go")).await.unwrap();
    assert_eq!(outcome.text, "fixed my input");

    let (content, is_error) = gateway.tool_result_of(1);
    assert!(is_error);
    assert!(content["error"].as_str().unwrap().contains("Invalid input"));
}

#[tokio::test]
async fn handler_validation_rejects_the_payload() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": "A", "deny": true})),
        ScriptedGateway::text("understood"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "pushy", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    engine.execute_agent(agent.id, json!("go")).await.unwrap();
    let (content, is_error) = gateway.tool_result_of(1);
    assert!(is_error);
    assert!(content["error"].as_str().unwrap().contains("Invalid input"));
}

#[tokio::test]
async fn handler_errors_are_fed_back_not_fatal() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": "BOOM"})),
        ScriptedGateway::text("the backend is down, sorry"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "resilient", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    let outcome = engine.execute_agent(agent.id, json!("go")).await.unwrap();
    assert_eq!(outcome.text, "the backend is down, sorry");

    let (content, is_error) = gateway.tool_result_of(1);
    assert!(is_error);
    assert!(content["error"]
        .as_str()
        .unwrap()
        .contains("inventory backend unavailable"));
}

#[tokio::test]
async fn inactive_tools_are_not_found() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": "A"})),
        ScriptedGateway::text("ok"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "worker", json!({})).await;
    let tool = make_lookup_tool(&engine, agent.id).await;
    engine.deactivate_tool(tool.id).await.unwrap();

    engine.execute_agent(agent.id, json!("go")).await.unwrap();
    let (content, is_error) = gateway.tool_result_of(1);
    assert!(is_error);
    assert!(content["error"].as_str().unwrap().contains("Tool not found"));

    // Deactivated tools also leave the agent's catalog.
    let first = gateway.request(0);
    assert!(first.tools.is_empty());
}

#[tokio::test]
async fn sub_agents_are_invoked_through_the_reserved_name() {
    let gateway = ScriptedGateway::new(vec![]);
    let engine = engine_with(gateway.clone()).await;

    let specialist = make_agent(&engine, "specialist", json!({})).await;
    let lead = make_agent(
        &engine,
        "lead",
        json!({"sub_agents": [specialist.id]}),
    )
    .await;

    *gateway.script.lock().unwrap() = vec![
        ScriptedGateway::tool_use(
            "t1",
            &format!("invoke_agent_{}", specialist.id),
            json!({"input": "summarize the incident"}),
        ),
        ScriptedGateway::text("incident summary: all clear"),
        ScriptedGateway::text("relayed: all clear"),
    ]
    .into();

    let outcome = engine.execute_agent(lead.id, json!("handle it")).await.unwrap();
    assert_eq!(outcome.text, "relayed: all clear");
    assert_eq!(gateway.calls(), 3);

    // The lead's catalog advertises the synthesized sub-agent tool.
    let first = gateway.request(0);
    assert_eq!(
        first.tools[0].name,
        format!("invoke_agent_{}", specialist.id)
    );

    // The sub-agent's answer came back as the tool result.
    let (content, is_error) = gateway.tool_result_of(2);
    assert!(!is_error);
    assert_eq!(content, json!({"text": "incident summary: all clear"}));
}

#[tokio::test]
async fn the_iteration_budget_is_enforced() {
    let looping: Vec<_> = (0..6)
        .map(|i| ScriptedGateway::tool_use(&format!("t{}", i), "lookup_sku", json!({"sku": "A"})))
        .collect();
    let gateway = ScriptedGateway::new(looping);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "obsessive", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    let result = engine.execute_agent(agent.id, json!("go")).await;
    assert!(matches!(result, Err(EngineError::IterationLimitExceeded(5))));
    assert_eq!(gateway.calls(), 5);
}

#[tokio::test]
async fn usage_is_summed_across_turns() {
    let gateway = ScriptedGateway::new(vec![
        ScriptedGateway::tool_use("t1", "lookup_sku", json!({"sku": "A"})),
        ScriptedGateway::text("done"),
    ]);
    let engine = engine_with(gateway.clone()).await;
    let agent = make_agent(&engine, "counter", json!({})).await;
    make_lookup_tool(&engine, agent.id).await;

    let outcome = engine.execute_agent(agent.id, json!("go")).await.unwrap();
    assert_eq!(outcome.usage.input_tokens, 6);
    assert_eq!(outcome.usage.output_tokens, 8);
    assert_eq!(outcome.usage.total(), 14);
}
