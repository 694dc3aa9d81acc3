//! Shared primitives for provider-agnostic LLM gateways.
//!
//! The engine talks to chat/completion providers through the
//! [`LlmGateway`] trait and the lightweight data types defined here. The
//! trait abstracts over concrete vendor wire formats while the supporting
//! structs describe chat messages, content blocks, tool catalogs, and
//! token accounting.
//!
//! A gateway is stateless: one [`CompletionRequest`] translates to one
//! provider call, and there is no implicit fallback between providers.
//! Conversation bookkeeping (history, tool loops, metrics) lives in the
//! agent runner, not here.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use flowllm::gateway::{ChatMessage, CompletionRequest, HttpGateway, LlmGateway};
//!
//! # async {
//! let gateway = HttpGateway::new("https://llm.example.com/v1/messages", "secret-key");
//!
//! let request = CompletionRequest {
//!     model: "large-v3".into(),
//!     system_prompt: "You are a terse assistant.".into(),
//!     messages: vec![ChatMessage::user_text("Who are you?")],
//!     tools: Vec::new(),
//!     temperature: 0.7,
//!     max_tokens: 1024,
//!     top_p: None,
//! };
//!
//! let response = gateway.complete(&request).await.unwrap();
//! println!("{}", response.text());
//! # };
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Message author. Tool results travel inside a `User` message as
/// [`ContentBlock::ToolResult`] blocks, mirroring common provider wire
/// formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant or user text.
    Text { text: String },
    /// The model asking for a tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    /// The caller answering a prior [`ContentBlock::ToolUse`] block.
    ToolResult {
        tool_use_id: String,
        content: JsonValue,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// An ordered chat message: a role plus one or more content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Build a plain-text user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Build the user message that carries one turn's tool results back
    /// to the model, in the original block order.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content: results,
        }
    }

    /// Build an assistant message from a response's content blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
        }
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

/// Prompt vs. completion token accounting for a single call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another call's usage into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Tool catalog entry forwarded to the provider for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
}

/// Everything needed for a single provider call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: Option<f64>,
}

/// Typed provider response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Concatenated text blocks, the terminal answer of a turn.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// The tool-use blocks of this turn, in emission order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }
}

/// Gateway failure classification.
///
/// `Transient` is the only retryable kind; retrying is the caller's
/// responsibility (the gateway never retries internally).
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Network failure or provider 5xx/429.
    Transient(String),
    /// Credentials rejected.
    Auth(String),
    /// The provider answered with a body the gateway cannot interpret.
    Schema(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transient(msg) => write!(f, "Transient gateway failure: {}", msg),
            GatewayError::Auth(msg) => write!(f, "Gateway authentication failed: {}", msg),
            GatewayError::Schema(msg) => write!(f, "Malformed gateway response: {}", msg),
        }
    }
}

impl Error for GatewayError {}

/// Trait-driven abstraction for a concrete LLM provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between concurrently running executions.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Issue one request to the provider and return its typed response.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError>;

    /// Identifier agents use to select this gateway (e.g. `"openai"`).
    fn provider_name(&self) -> &str;
}

/// Registry mapping an agent's provider tag to a gateway instance.
///
/// Mirrors the multi-protocol tool registry pattern: providers are
/// registered once at engine construction and resolved per agent run.
///
/// # Example
///
/// ```rust,no_run
/// use flowllm::gateway::{GatewayRouter, HttpGateway};
/// use std::sync::Arc;
///
/// let mut router = GatewayRouter::new();
/// router.register(Arc::new(HttpGateway::new("https://llm.example.com", "key")));
/// assert!(router.resolve("http").is_ok());
/// ```
#[derive(Default)]
pub struct GatewayRouter {
    gateways: HashMap<String, Arc<dyn LlmGateway>>,
}

impl GatewayRouter {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    /// Register a gateway under its own provider name. Re-registering a
    /// name replaces the previous instance.
    pub fn register(&mut self, gateway: Arc<dyn LlmGateway>) {
        self.gateways
            .insert(gateway.provider_name().to_string(), gateway);
    }

    /// Resolve a provider tag to its gateway.
    pub fn resolve(&self, provider: &str) -> Result<Arc<dyn LlmGateway>, crate::flowllm::error::EngineError> {
        self.gateways.get(provider).cloned().ok_or_else(|| {
            crate::flowllm::error::EngineError::NotFound(format!("LLM provider '{}'", provider))
        })
    }

    /// Registered provider tags, for diagnostics.
    pub fn providers(&self) -> Vec<&str> {
        self.gateways.keys().map(|k| k.as_str()).collect()
    }
}

pub use crate::flowllm::clients::http::HttpGateway;
