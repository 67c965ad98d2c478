//! Anthropic Messages API adapter.
//!
//! Implements [`LmProvider`] for Claude models. The system context is sent
//! as a single content block carrying `cache_control: {type: "ephemeral"}`;
//! because the serialized prefix (tools, then system) is byte-stable across
//! iterations of one request, repeated iterations bill mostly at the cached
//! rate. Cache reads surface as `cached_tokens`; cache writes are folded
//! into `input_tokens`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use switchboard_types::config::{LlmConfig, TokenPricing};
use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::{
    AllowedToolsView, LmMessage, LmReply, LmRole, MessagePayload, SystemContext, TokenUsage,
    ToolUseRequest, UserProfile,
};
use switchboard_types::traits::LmProvider;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Attempts per invocation; only transport-level failures are retried.
const MAX_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Anthropic LM adapter.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    config: LlmConfig,
}

// -- Messages API request/response types --

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDef>>,
}

/// System prompt block with the prompt-cache marker.
#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

impl SystemBlock {
    fn cacheable(text: String) -> Self {
        Self {
            block_type: "text",
            text,
            cache_control: Some(CacheControl {
                cache_type: "ephemeral",
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    cache_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
struct ApiToolDef {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, config: LlmConfig) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_BASE.to_string(), config)
    }

    /// Custom base URL, for tests.
    pub fn with_base_url(api_key: String, api_base: String, config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            api_base,
            config,
        }
    }

    /// Read the API key from `ANTHROPIC_API_KEY`.
    pub fn from_env(config: LlmConfig) -> Result<Self, SwitchboardError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| SwitchboardError::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, config))
    }

    fn convert_messages(messages: &[LmMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    LmRole::User => "user",
                    LmRole::Assistant => "assistant",
                };
                let content = match &m.payload {
                    MessagePayload::Text(text) => ApiContent::Text(text.clone()),
                    MessagePayload::ToolUse { text, requests } => {
                        let mut blocks = Vec::new();
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text { text: text.clone() });
                        }
                        blocks.extend(requests.iter().map(|r| ContentBlock::ToolUse {
                            id: r.id.clone(),
                            name: r.name.clone(),
                            input: r.arguments.clone(),
                        }));
                        ApiContent::Blocks(blocks)
                    }
                    MessagePayload::ToolResults(results) => ApiContent::Blocks(
                        results
                            .iter()
                            .map(|r| {
                                let content = if r.outcome.success {
                                    match r.outcome.output.as_str() {
                                        Some(s) => s.to_string(),
                                        None => r.outcome.output.to_string(),
                                    }
                                } else {
                                    r.outcome
                                        .error
                                        .clone()
                                        .unwrap_or_else(|| "tool failed".to_string())
                                };
                                ContentBlock::ToolResult {
                                    tool_use_id: r.request_id.clone(),
                                    content,
                                    is_error: (!r.outcome.success).then_some(true),
                                }
                            })
                            .collect(),
                    ),
                };
                ApiMessage { role, content }
            })
            .collect()
    }

    fn convert_tools(view: &AllowedToolsView) -> Vec<ApiToolDef> {
        view.tools()
            .iter()
            .map(|t| ApiToolDef {
                name: t.qualified_name(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    fn parse_response(resp: MessagesResponse) -> LmReply {
        let mut text_parts = Vec::new();
        let mut tool_requests = Vec::new();
        for block in resp.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_requests.push(ToolUseRequest {
                        id,
                        name,
                        arguments: input,
                    });
                }
                ContentBlock::ToolResult { .. } => {}
            }
        }
        LmReply {
            text: text_parts.join(""),
            tool_requests,
            model: resp.model,
            usage: TokenUsage {
                // Cache writes are billed as input; fold them in.
                input_tokens: resp.usage.input_tokens + resp.usage.cache_creation_input_tokens,
                output_tokens: resp.usage.output_tokens,
                cached_tokens: resp.usage.cache_read_input_tokens,
            },
        }
    }

    async fn send_once(&self, request: &MessagesRequest) -> Result<LmReply, SwitchboardError> {
        let url = format!("{}/v1/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    // Transport-shaped: the caller may retry.
                    SwitchboardError::Timeout(format!("LM request failed: {e}"))
                } else {
                    SwitchboardError::Llm(format!("LM request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SwitchboardError::LlmRateLimited(
                "provider rate limit exceeded (429)".to_string(),
            ));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SwitchboardError::Llm(
                "authentication failed: invalid API key".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(SwitchboardError::Llm(format!(
                    "API error ({}): {}",
                    err.error.error_type, err.error.message
                )));
            }
            return Err(SwitchboardError::Llm(format!(
                "API error (HTTP {status}): {body}"
            )));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| SwitchboardError::Llm(format!("failed to parse response: {e}")))?;
        Ok(Self::parse_response(body))
    }
}

#[async_trait]
impl LmProvider for AnthropicAdapter {
    fn build_system_context(
        &self,
        view: &AllowedToolsView,
        profile: &UserProfile,
    ) -> SystemContext {
        let mut text = String::from(
            "You are Switchboard, a bridge that answers questions by calling \
             the tools offered to you. Use tools when the question needs live \
             data; answer directly when it does not. Tool names are of the \
             form <service>__<tool>. If a tool call is rejected as not \
             permitted, adapt your plan to the tools you do have.",
        );
        text.push_str(&format!(
            "\n\nRequesting user: {} (role: {})",
            profile.user_id, profile.role
        ));
        if view.is_empty() {
            text.push_str("\nNo tools are available for this user.");
        } else {
            text.push_str("\nTools available for this user:");
            for tool in view.tools() {
                text.push_str(&format!("\n- {}", tool.qualified_name()));
            }
        }
        SystemContext { text }
    }

    async fn invoke(
        &self,
        system: &SystemContext,
        messages: &[LmMessage],
        tools: &AllowedToolsView,
    ) -> Result<LmReply, SwitchboardError> {
        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: Some(vec![SystemBlock::cacheable(system.text.clone())]),
            messages: Self::convert_messages(messages),
            temperature: self.config.temperature,
            tools: if tools.is_empty() {
                None
            } else {
                Some(Self::convert_tools(tools))
            },
        };

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(&request).await {
                Ok(reply) => return Ok(reply),
                Err(e @ SwitchboardError::Timeout(_)) => {
                    tracing::warn!(attempt, error = %e, "LM transport failure");
                    last_error = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(match last_error {
            Some(SwitchboardError::Timeout(msg)) => {
                SwitchboardError::Llm(format!("LM unreachable after {MAX_ATTEMPTS} attempts: {msg}"))
            }
            Some(other) => other,
            None => SwitchboardError::Internal("LM retry loop exited empty".to_string()),
        })
    }

    fn cost(&self, usage: &TokenUsage) -> f64 {
        let TokenPricing {
            input_per_mtok,
            output_per_mtok,
            cached_per_mtok,
        } = self.config.pricing;
        (usage.input_tokens as f64 * input_per_mtok
            + usage.output_tokens as f64 * output_per_mtok
            + usage.cached_tokens as f64 * cached_per_mtok)
            / 1_000_000.0
    }
}
