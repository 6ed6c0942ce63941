//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn send(&self, request: &AnthropicRequest) -> Result<AnthropicResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let reason = match serde_json::from_str::<AnthropicError>(&body) {
                Ok(err) => format!("{}: {}", err.error.error_type, err.error.message),
                Err(_) => format!("HTTP {status}: {}", body_excerpt(&body)),
            };
            return Err(classify_status(status, reason));
        }

        serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("{e} in {}", body_excerpt(&body)),
        })
    }
}

fn body_excerpt(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

/// Parse "prompt is too long: 210000 tokens > 200000 maximum".
fn context_overflow(reason: &str) -> Option<(usize, usize)> {
    let rest = reason.split("prompt is too long:").nth(1)?;
    let mut numbers = rest
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(str::parse::<usize>);
    let used = numbers.next()?.ok()?;
    let limit = numbers.next()?.ok()?;
    Some((used, limit))
}

fn classify_status(status: StatusCode, reason: String) -> LlmError {
    if status == StatusCode::BAD_REQUEST
        && let Some((used, limit)) = context_overflow(&reason)
    {
        return LlmError::ContextLengthExceeded { used, limit };
    }
    let provider = PROVIDER.to_string();
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            LlmError::InvalidRequest { provider, reason }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed { provider },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider,
            retry_after: None,
        },
        _ => LlmError::RequestFailed { provider, reason },
    }
}

/// Convert chat history into Anthropic's system + messages shape.
///
/// Consecutive tool results are merged into one user message, which the
/// API requires after an assistant turn with several `tool_use` blocks.
fn build_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = None;
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system = Some(msg.content.clone()),
            Role::User => out.push(AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.trim().is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                blocks.extend(msg.tool_calls.iter().map(|tc| AnthropicContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: tc.arguments.clone(),
                }));
                out.push(AnthropicMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            Role::Tool => {
                let block = AnthropicContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                };
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, AnthropicContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    (system, out)
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|t| AnthropicTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.parameters.clone(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        match self.model.as_str() {
            m if m.contains("opus") => (dec!(0.000015), dec!(0.000075)),
            m if m.contains("haiku") => (dec!(0.0000008), dec!(0.000004)),
            _ => (dec!(0.000003), dec!(0.000015)),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, messages) = build_messages(&request.messages);
        let body = AnthropicRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: request.temperature,
            tools: None,
        };

        let response = self.send(&body).await?;
        let content = response
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            finish_reason: parse_finish_reason(response.stop_reason.as_deref()),
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let (system, messages) = build_messages(&request.messages);

        let body = AnthropicRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: None,
            tools: Some(build_tools(&request.tools)),
        };

        let response = self.send(&body).await?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                AnthropicContentBlock::Text { text } => text_parts.push(text),
                AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                _ => {}
            }
        }

        Ok(ToolCompletionResponse {
            content: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
            tool_calls,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            finish_reason: parse_finish_reason(response.stop_reason.as_deref()),
        })
    }
}
