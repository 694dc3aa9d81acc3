//! HTTP gateway client.
//!
//! [`HttpGateway`] speaks a messages-style JSON wire format over HTTP:
//! the request carries the model, system prompt, ordered messages (each
//! a list of content blocks), the turn's tool catalog, and sampling
//! parameters; the response carries content blocks, a stop reason, and
//! token usage. This shape matches the content-block convention of the
//! major providers, so a deployment only needs to point the endpoint at
//! the right relay.
//!
//! Failures are classified for the caller's retry policy: connection
//! errors, timeouts, 408/429, and 5xx are transient; 401/403 are
//! permanent auth failures; anything the gateway cannot deserialize is a
//! permanent schema failure.

use crate::flowllm::gateway::{
    CompletionRequest, CompletionResponse, ContentBlock, GatewayError, LlmGateway, StopReason,
    TokenUsage,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// reqwest-backed [`LlmGateway`] implementation.
pub struct HttpGateway {
    endpoint: String,
    api_key: String,
    provider: String,
    client: reqwest::Client,
}

impl HttpGateway {
    /// Create a gateway for the given messages endpoint, registered under
    /// the default provider tag `"http"`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            provider: "http".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Override the provider tag this gateway is registered under.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Override the default request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        self
    }

    fn parse_stop_reason(raw: Option<String>) -> StopReason {
        match raw.as_deref() {
            None | Some("end_turn") | Some("stop") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") | Some("length") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.to_string()),
        }
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let mut body = json!({
            "model": request.model,
            "system": request.system_prompt,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)
                .map_err(|e| GatewayError::Schema(e.to_string()))?;
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::Auth(format!("provider returned {}", status)));
        }
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(GatewayError::Transient(format!(
                "provider returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Schema(format!("provider returned {}", status)));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Schema(e.to_string()))?;

        Ok(CompletionResponse {
            content: wire.content,
            stop_reason: Self::parse_stop_reason(wire.stop_reason),
            usage: TokenUsage {
                input_tokens: wire.usage.input_tokens,
                output_tokens: wire.usage.output_tokens,
            },
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(
            HttpGateway::parse_stop_reason(Some("end_turn".into())),
            StopReason::EndTurn
        );
        assert_eq!(
            HttpGateway::parse_stop_reason(Some("tool_use".into())),
            StopReason::ToolUse
        );
        assert_eq!(
            HttpGateway::parse_stop_reason(Some("length".into())),
            StopReason::MaxTokens
        );
        assert_eq!(HttpGateway::parse_stop_reason(None), StopReason::EndTurn);
        assert_eq!(
            HttpGateway::parse_stop_reason(Some("weird".into())),
            StopReason::Other("weird".into())
        );
    }
}
