//! Tool dispatch.
//!
//! The dispatcher resolves a tool name to a handler and executes it with
//! a JSON payload. Resolution order:
//!
//! 1. Names matching the reserved pattern `invoke_agent_<id>` route to
//!    the agent execution engine (sub-agent orchestration) through the
//!    [`AgentInvoker`] seam.
//! 2. Otherwise the name is looked up as a Tool record; missing or
//!    inactive tools fail as `ToolNotFound`.
//! 3. `builtin` / `api` tools run the in-process [`ToolHandler`]
//!    registered under the tool's handler symbol; `rpc` tools POST a
//!    JSON-RPC 2.0 `tools/call` request to the tool's endpoint.
//!
//! Every failure (unknown tool, rejected input, handler error, RPC
//! error) is captured as an error blob `{error, is_error: true}` rather
//! than propagated, so the agent loop can hand it back to the model as a
//! `tool_result` and let the model recover.
//!
//! A single dispatch is independent of every other; the dispatcher is
//! safe to call from many tasks concurrently.

use crate::flowllm::error::EngineError;
use crate::flowllm::model::{ToolKind, ToolRecord};
use crate::flowllm::schema::validate_input;
use crate::flowllm::store::Store;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Reserved tool-name prefix for dynamic sub-agent dispatch.
pub const AGENT_TOOL_PREFIX: &str = "invoke_agent_";

/// In-process tool implementation, registered under a handler symbol.
///
/// # Example
///
/// ```
/// use flowllm::dispatcher::ToolHandler;
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use std::error::Error;
///
/// struct Echo;
///
/// #[async_trait]
/// impl ToolHandler for Echo {
///     async fn execute(&self, input: Value) -> Result<Value, Box<dyn Error + Send + Sync>> {
///         Ok(json!({"echo": input}))
///     }
/// }
/// ```
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with an input payload already checked against the
    /// tool's stored input schema.
    async fn execute(&self, input: JsonValue) -> Result<JsonValue, Box<dyn Error + Send + Sync>>;

    /// Optional extra validation beyond the stored schema. Returning
    /// `false` rejects the call with `InvalidInput` before `execute`.
    fn validate(&self, _input: &JsonValue) -> bool {
        true
    }
}

/// Seam through which the dispatcher reaches back into the agent
/// execution engine for `invoke_agent_<id>` calls, without a concrete
/// dependency on the runner.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke_agent(
        &self,
        agent_id: i64,
        input: JsonValue,
        scope: CallScope,
    ) -> Result<JsonValue, EngineError>;
}

/// Where a tool call originates, threaded through for record ownership.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallScope {
    pub workflow_execution_id: Option<i64>,
    pub workflow_step_id: Option<i64>,
}

/// Result of one dispatch. `is_error` mirrors the `tool_result` flag the
/// agent loop forwards to the model.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: JsonValue,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: JsonValue) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self {
            content: json!({"error": message.to_string(), "is_error": true}),
            is_error: true,
        }
    }
}

/// Classified dispatch failures, used for error-blob messages.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// No active tool row (or registered handler) matches the name.
    NotFound(String),
    /// The payload failed schema or handler validation.
    InvalidInput(String),
    /// The handler or remote endpoint reported a failure.
    ExecutionFailed(String),
    /// Transport-level RPC failure.
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Resolves tool names and executes handlers.
pub struct ToolDispatcher {
    store: Store,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    agent_invoker: RwLock<Option<Arc<dyn AgentInvoker>>>,
    http: reqwest::Client,
    rpc_seq: AtomicU64,
}

impl ToolDispatcher {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            agent_invoker: RwLock::new(None),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            rpc_seq: AtomicU64::new(1),
        }
    }

    /// Register an in-process handler under its symbol. Re-registering a
    /// symbol replaces the previous handler.
    pub async fn register_handler(&self, symbol: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().await.insert(symbol.into(), handler);
    }

    /// Remove a registered handler.
    pub async fn unregister_handler(&self, symbol: &str) {
        self.handlers.write().await.remove(symbol);
    }

    /// Wire the agent execution engine in after construction (the runner
    /// and the dispatcher reference each other through this seam).
    pub async fn set_agent_invoker(&self, invoker: Arc<dyn AgentInvoker>) {
        *self.agent_invoker.write().await = Some(invoker);
    }

    /// If `name` uses the reserved sub-agent pattern, extract the agent id.
    pub fn parse_agent_tool(name: &str) -> Option<i64> {
        name.strip_prefix(AGENT_TOOL_PREFIX)?.parse().ok()
    }

    /// Resolve and execute. Never fails: every failure path becomes an
    /// error blob the model can observe.
    pub async fn dispatch(&self, tool_name: &str, input: JsonValue, scope: CallScope) -> ToolOutcome {
        if let Some(agent_id) = Self::parse_agent_tool(tool_name) {
            return self.dispatch_agent(agent_id, input, scope).await;
        }

        let tool = match self.store.get_tool_by_name(tool_name).await {
            Ok(Some(tool)) if tool.active => tool,
            Ok(_) => return ToolOutcome::error(ToolError::NotFound(tool_name.to_string())),
            Err(e) => return ToolOutcome::error(ToolError::ExecutionFailed(e.to_string())),
        };

        if let Err(e) = validate_input(&tool.input_schema, &input) {
            return ToolOutcome::error(ToolError::InvalidInput(e.to_string()));
        }

        match tool.kind {
            ToolKind::Builtin | ToolKind::Api => self.dispatch_in_process(&tool, input).await,
            ToolKind::Rpc => self.dispatch_rpc(&tool, input).await,
        }
    }

    async fn dispatch_agent(&self, agent_id: i64, input: JsonValue, scope: CallScope) -> ToolOutcome {
        let invoker = self.agent_invoker.read().await.clone();
        let invoker = match invoker {
            Some(invoker) => invoker,
            None => {
                return ToolOutcome::error(ToolError::ExecutionFailed(
                    "agent invoker not configured".to_string(),
                ))
            }
        };
        match invoker.invoke_agent(agent_id, input, scope).await {
            Ok(result) => ToolOutcome::ok(result),
            Err(e) => ToolOutcome::error(e),
        }
    }

    async fn dispatch_in_process(&self, tool: &ToolRecord, input: JsonValue) -> ToolOutcome {
        let handler = self.handlers.read().await.get(&tool.handler).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                return ToolOutcome::error(ToolError::NotFound(format!(
                    "handler '{}' for tool '{}'",
                    tool.handler, tool.name
                )))
            }
        };
        if !handler.validate(&input) {
            return ToolOutcome::error(ToolError::InvalidInput(format!(
                "handler '{}' rejected the payload",
                tool.handler
            )));
        }
        match handler.execute(input).await {
            Ok(result) => ToolOutcome::ok(result),
            Err(e) => ToolOutcome::error(ToolError::ExecutionFailed(e.to_string())),
        }
    }

    /// JSON-RPC 2.0 `tools/call` against the tool's endpoint. The
    /// `result` member is the tool result; an `error` member (or any
    /// transport failure) becomes an error blob.
    async fn dispatch_rpc(&self, tool: &ToolRecord, input: JsonValue) -> ToolOutcome {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.rpc_seq.fetch_add(1, Ordering::Relaxed),
            "method": "tools/call",
            "params": {
                "name": tool.name,
                "arguments": input,
            }
        });

        let response = match self.http.post(&tool.handler).json(&request).send().await {
            Ok(response) => response,
            Err(e) => return ToolOutcome::error(ToolError::ProtocolError(e.to_string())),
        };
        if !response.status().is_success() {
            return ToolOutcome::error(ToolError::ProtocolError(format!(
                "RPC endpoint returned status {}",
                response.status()
            )));
        }
        let body: JsonValue = match response.json().await {
            Ok(body) => body,
            Err(e) => return ToolOutcome::error(ToolError::ProtocolError(e.to_string())),
        };

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown JSON-RPC error");
            return ToolOutcome::error(ToolError::ExecutionFailed(message.to_string()));
        }
        match body.get("result") {
            Some(result) => ToolOutcome::ok(result.clone()),
            None => ToolOutcome::error(ToolError::ProtocolError(
                "JSON-RPC response carried neither result nor error".to_string(),
            )),
        }
    }
}
