//! Agent execution engine.
//!
//! [`AgentRunner`] drives the bounded multi-turn loop that lets an LLM
//! reach a terminal assistant answer: call the gateway, dispatch any tool
//! calls the model emits (concurrently, results reassembled in block
//! order), feed the results back, repeat. The loop is capped at a
//! configurable iteration budget (default 5) and persists an
//! agent-execution record across its lifecycle with token and wall-clock
//! metrics.
//!
//! Tool failures are deliberately not fatal: the dispatcher hands back an
//! error blob which this loop forwards to the model as a `tool_result`
//! with `is_error`, so the model can correct itself. Only gateway
//! failures (after a short in-turn retry budget) and the iteration cap
//! abort a run.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::agent_runner::AgentRunner;
//! use flowllm::dispatcher::CallScope;
//! use serde_json::json;
//!
//! # async fn demo(runner: AgentRunner) {
//! let outcome = runner
//!     .run(1, json!({"question": "What is our refund policy?"}), CallScope::default())
//!     .await
//!     .unwrap();
//! println!("{} ({} tokens)", outcome.text, outcome.usage.total());
//! # }
//! ```

use crate::flowllm::dispatcher::{AgentInvoker, CallScope, ToolDispatcher, AGENT_TOOL_PREFIX};
use crate::flowllm::error::EngineError;
use crate::flowllm::gateway::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentBlock, GatewayError, GatewayRouter,
    StopReason, TokenUsage, ToolSpec,
};
use crate::flowllm::model::{AgentRecord, ToolRecord};
use crate::flowllm::store::Store;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default iteration budget for the tool loop.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// In-turn retry budget for transient gateway failures.
const TRANSIENT_RETRIES: usize = 2;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Result of a completed agent run.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    /// Concatenated text blocks of the final assistant turn.
    pub text: String,
    /// The final assistant content blocks, verbatim.
    pub raw: JsonValue,
    /// Token usage summed across every gateway call of the run.
    pub usage: TokenUsage,
    /// Id of the persisted agent-execution record.
    pub execution_id: i64,
}

/// Drives agent conversations against the gateway and dispatcher.
pub struct AgentRunner {
    store: Store,
    gateways: Arc<GatewayRouter>,
    dispatcher: Arc<ToolDispatcher>,
    max_iterations: usize,
}

impl AgentRunner {
    pub fn new(store: Store, gateways: Arc<GatewayRouter>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            store,
            gateways,
            dispatcher,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Override the iteration budget (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Execute an agent with the given input.
    pub async fn run(
        &self,
        agent_id: i64,
        input: JsonValue,
        scope: CallScope,
    ) -> Result<AgentRunOutcome, EngineError> {
        self.run_with_extra_tools(agent_id, input, scope, Vec::new())
            .await
    }

    /// Execute an agent with additional caller-injected tool specs (e.g.
    /// `invoke_agent_<id>` entries synthesized by an orchestration).
    pub async fn run_with_extra_tools(
        &self,
        agent_id: i64,
        input: JsonValue,
        scope: CallScope,
        extra_tools: Vec<ToolSpec>,
    ) -> Result<AgentRunOutcome, EngineError> {
        let agent = self.store.get_agent(agent_id).await?;
        if !agent.active {
            return Err(EngineError::AgentInactive(agent_id));
        }

        let gateway = self.gateways.resolve(&agent.provider)?;
        let mut tools = self.catalog_for(&agent).await?;
        tools.extend(extra_tools);

        let mut messages = vec![ChatMessage::user_text(initial_user_text(&input))];
        let execution_id = self
            .store
            .insert_agent_execution(
                agent_id,
                scope.workflow_execution_id,
                scope.workflow_step_id,
                &input,
            )
            .await?;

        let started = Instant::now();
        let mut usage = TokenUsage::default();

        for iteration in 0..self.max_iterations {
            let request = CompletionRequest {
                model: agent.model.clone(),
                system_prompt: agent.system_prompt.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                temperature: agent.temperature,
                max_tokens: agent.max_tokens.max(1) as u32,
                top_p: None,
            };

            let response = match self.call_with_retries(gateway.as_ref(), &request).await {
                Ok(response) => response,
                Err(e) => {
                    self.store
                        .fail_agent_execution(
                            execution_id,
                            &e.to_string(),
                            usage.total() as i64,
                            started.elapsed().as_millis() as i64,
                        )
                        .await?;
                    return Err(e);
                }
            };
            usage.add(&response.usage);

            log::debug!(
                "agent {} iteration {}: stop_reason {:?}, {} blocks",
                agent.name,
                iteration + 1,
                response.stop_reason,
                response.content.len()
            );

            messages.push(ChatMessage::assistant(response.content.clone()));

            match &response.stop_reason {
                StopReason::ToolUse if !response.tool_uses().is_empty() => {
                    let results = self.dispatch_tool_uses(&response, scope).await;
                    messages.push(ChatMessage::tool_results(results));
                }
                _ => {
                    // end_turn, max_tokens, and unknown reasons are all
                    // terminal for the loop.
                    return self
                        .finish(execution_id, &response, usage, started.elapsed())
                        .await;
                }
            }
        }

        let err = EngineError::IterationLimitExceeded(self.max_iterations);
        self.store
            .fail_agent_execution(
                execution_id,
                &err.to_string(),
                usage.total() as i64,
                started.elapsed().as_millis() as i64,
            )
            .await?;
        Err(err)
    }

    /// Visible tools: every active binding, plus one `invoke_agent_<id>`
    /// spec per sub-agent listed in the agent's config.
    async fn catalog_for(&self, agent: &AgentRecord) -> Result<Vec<ToolSpec>, EngineError> {
        let mut tools: Vec<ToolSpec> = self
            .store
            .tools_for_agent(agent.id)
            .await?
            .iter()
            .map(tool_spec)
            .collect();

        if let Some(sub_agents) = agent.config.get("sub_agents").and_then(|s| s.as_array()) {
            for sub_id in sub_agents.iter().filter_map(|v| v.as_i64()) {
                match self.store.get_agent(sub_id).await {
                    Ok(sub) if sub.active => tools.push(agent_tool_spec(&sub)),
                    Ok(_) | Err(EngineError::NotFound(_)) => {
                        log::warn!(
                            "agent {} lists unusable sub-agent {}; skipping",
                            agent.id,
                            sub_id
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(tools)
    }

    async fn call_with_retries(
        &self,
        gateway: &dyn crate::flowllm::gateway::LlmGateway,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, EngineError> {
        let mut attempt = 0;
        loop {
            match gateway.complete(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    log::warn!("transient gateway failure (attempt {}): {}", attempt, e);
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                }
                Err(GatewayError::Transient(msg)) => return Err(EngineError::Transient(msg)),
                Err(e) => return Err(EngineError::Gateway(e.to_string())),
            }
        }
    }

    /// Dispatch every tool_use block of a turn concurrently and rebuild
    /// the results in the original block order.
    async fn dispatch_tool_uses(
        &self,
        response: &CompletionResponse,
        scope: CallScope,
    ) -> Vec<ContentBlock> {
        let calls: Vec<(String, String, JsonValue)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();

        let outcomes = join_all(
            calls
                .iter()
                .map(|(_, name, input)| self.dispatcher.dispatch(name, input.clone(), scope)),
        )
        .await;

        calls
            .into_iter()
            .zip(outcomes)
            .map(|((id, _, _), outcome)| ContentBlock::ToolResult {
                tool_use_id: id,
                content: outcome.content,
                is_error: outcome.is_error,
            })
            .collect()
    }

    async fn finish(
        &self,
        execution_id: i64,
        response: &CompletionResponse,
        usage: TokenUsage,
        elapsed: Duration,
    ) -> Result<AgentRunOutcome, EngineError> {
        let text = response.text();
        let raw = serde_json::to_value(&response.content)?;
        self.store
            .complete_agent_execution(
                execution_id,
                &json!({"text": text}),
                usage.total() as i64,
                elapsed.as_millis() as i64,
            )
            .await?;
        Ok(AgentRunOutcome {
            text,
            raw,
            usage,
            execution_id,
        })
    }
}

#[async_trait]
impl AgentInvoker for AgentRunner {
    async fn invoke_agent(
        &self,
        agent_id: i64,
        input: JsonValue,
        scope: CallScope,
    ) -> Result<JsonValue, EngineError> {
        let outcome = self.run(agent_id, input, scope).await?;
        Ok(json!({"text": outcome.text}))
    }
}

/// Wire-catalog entry for a stored tool.
pub fn tool_spec(tool: &ToolRecord) -> ToolSpec {
    ToolSpec {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

/// Synthesized catalog entry for sub-agent dispatch.
pub fn agent_tool_spec(agent: &AgentRecord) -> ToolSpec {
    ToolSpec {
        name: format!("{}{}", AGENT_TOOL_PREFIX, agent.id),
        description: format!("Delegate a task to the '{}' agent.", agent.name),
        input_schema: json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Task or question for the sub-agent"
                }
            },
            "required": ["input"]
        }),
    }
}

/// Seed text for the first user message: strings verbatim, anything else
/// rendered as compact JSON.
fn initial_user_text(input: &JsonValue) -> String {
    match input {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
