//! Provider for OpenAI-compatible chat completion endpoints (OpenAI, Ollama,
//! LM Studio, vLLM) with automatic retry for rate limits and server errors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ContentBlock, Message, Provider, ProviderRequest, ProviderResult, Role, StopReason, ToolCall,
    ToolCapableProvider, ToolDefinition,
};
use crate::estimate::{price_for, ModelPricing};

const MAX_RETRIES: u32 = 2;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Bytes of an error body kept in the result.
const MAX_ERROR_BODY: usize = 500;

pub struct OpenAiProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    pricing: HashMap<String, ModelPricing>,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            pricing: HashMap::new(),
        }
    }

    /// Price overrides consulted before the built-in table.
    pub fn with_pricing(mut self, pricing: HashMap<String, ModelPricing>) -> Self {
        self.pricing = pricing;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// POST the request, retrying 429 and 5xx responses with backoff.
    /// Returns the final status and body.
    async fn post_with_retry(&self, body: &ChatRequest<'_>, timeout: Duration) -> Result<(StatusCode, String)> {
        let url = self.endpoint();
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(&url).json(body);
            if !self.api_key.is_empty() {
                request = request.bearer_auth(&self.api_key);
            }
            if !timeout.is_zero() {
                request = request.timeout(timeout);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(anyhow!("Request timed out: {}", e)),
                Err(e) if e.is_connect() => return Err(anyhow!("Connection failed: {}", e)),
                Err(e) => return Err(anyhow!("Request failed: {}", e)),
            };

            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            let text = response
                .text()
                .await
                .map_err(|e| anyhow!("Failed to read response: {}", e))?;

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable || attempt >= MAX_RETRIES {
                if attempt > 0 {
                    tracing::info!(provider = %self.name, attempt, status = status.as_u16(), "Request finished after retries");
                }
                return Ok((status, text));
            }

            let delay = retry_after
                .unwrap_or(BASE_RETRY_DELAY * 2u32.pow(attempt))
                .min(MAX_RETRY_DELAY);
            tracing::warn!(
                provider = %self.name,
                attempt = attempt + 1,
                status = status.as_u16(),
                ?delay,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResult> {
        let model = if req.model.is_empty() {
            self.default_model.as_str()
        } else {
            req.model.as_str()
        };
        if model.is_empty() {
            return Err(anyhow!("no model specified for provider {:?}", self.name));
        }

        let body = ChatRequest {
            model,
            messages: build_messages(req),
            tools: req.tools.iter().map(WireTool::from).collect(),
        };
        tracing::debug!(
            provider = %self.name,
            model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Sending chat completion"
        );

        let started = Instant::now();
        let (status, text) = self.post_with_retry(&body, req.timeout).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Ok(ProviderResult {
                duration_ms: elapsed_ms,
                ..ProviderResult::error(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    truncate_body(&text)
                ))
            });
        }
        Ok(parse_response(&text, elapsed_ms, price_for(&self.pricing, model)))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, req: &ProviderRequest) -> Result<ProviderResult> {
        self.complete(req).await
    }

    fn as_tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
        Some(self)
    }
}

#[async_trait]
impl ToolCapableProvider for OpenAiProvider {
    async fn execute_with_tools(&self, req: &ProviderRequest) -> Result<ProviderResult> {
        self.complete(req).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Default, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "String::is_empty")]
    tool_call_id: String,
}

impl WireMessage {
    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

impl<'a> From<&'a ToolDefinition> for WireTool<'a> {
    fn from(def: &'a ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: WireFunctionDef {
                name: &def.name,
                description: &def.description,
                parameters: &def.input_schema,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatResponse {
    id: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiError {
    message: String,
}

/// System prompt, the task prompt, then the tool conversation so far.
fn build_messages(req: &ProviderRequest) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(req.messages.len() + 2);
    if !req.system_prompt.is_empty() {
        messages.push(WireMessage::text("system", req.system_prompt.clone()));
    }
    messages.push(WireMessage::text("user", req.prompt.clone()));
    for message in &req.messages {
        convert_message(message, &mut messages);
    }
    messages
}

/// Tool uses become `tool_calls` on the assistant message; each tool result
/// becomes its own `tool` message.
fn convert_message(message: &Message, out: &mut Vec<WireMessage>) {
    let mut text = Vec::new();
    match message.role {
        Role::Assistant => {
            let mut tool_calls = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text { text: t } => text.push(t.as_str()),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(WireToolCall {
                        id: id.clone(),
                        kind: function_type(),
                        function: WireFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult { .. } => {}
                }
            }
            out.push(WireMessage {
                role: "assistant",
                content: text.join("\n"),
                tool_calls,
                ..Default::default()
            });
        }
        Role::User => {
            for block in &message.content {
                match block {
                    ContentBlock::Text { text: t } => text.push(t.as_str()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(WireMessage {
                        role: "tool",
                        content: content.clone(),
                        tool_call_id: tool_use_id.clone(),
                        ..Default::default()
                    }),
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text.is_empty() {
                out.push(WireMessage::text("user", text.join("\n")));
            }
        }
    }
}

fn parse_response(body: &str, elapsed_ms: u64, pricing: ModelPricing) -> ProviderResult {
    let parsed: ChatResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return ProviderResult {
                duration_ms: elapsed_ms,
                ..ProviderResult::error(format!("parse response: {}", e))
            }
        }
    };
    if let Some(error) = parsed.error {
        return ProviderResult {
            duration_ms: elapsed_ms,
            ..ProviderResult::error(error.message)
        };
    }

    let mut result = ProviderResult {
        duration_ms: elapsed_ms,
        provider_ms: elapsed_ms,
        session_id: parsed.id,
        ..Default::default()
    };

    if let Some(choice) = parsed.choices.into_iter().next() {
        result.output = choice.message.content.unwrap_or_default();
        result.tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                input: parse_arguments(&tc.function.arguments),
            })
            .collect();
        result.stop_reason = match choice.finish_reason.as_deref() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            _ if !result.tool_calls.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
    }

    if let Some(usage) = parsed.usage {
        result.tokens_in = usage.prompt_tokens;
        result.tokens_out = usage.completion_tokens;
        result.cost_usd = pricing.cost(usage.prompt_tokens, usage.completion_tokens);
    }
    result
}

/// Arguments arrive as a JSON string; an empty string means no arguments.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
