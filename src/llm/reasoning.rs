//! Reasoning layer: wraps an LLM provider with tool calling support.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, LlmProvider, ToolCall, ToolCompletionRequest, ToolDefinition,
};

/// Context for a reasoning operation.
#[derive(Default)]
pub struct ReasoningContext {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

impl ReasoningContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage from an LLM call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Cost of this usage at the provider's per-token prices.
    pub fn cost(&self, llm: &dyn LlmProvider) -> Decimal {
        let (input, output) = llm.cost_per_token();
        input * Decimal::from(self.input_tokens) + output * Decimal::from(self.output_tokens)
    }
}

/// Result of a reasoning call: either text or tool calls.
#[derive(Debug)]
pub enum RespondResult {
    /// The model responded with text.
    Text(String),
    /// The model wants to call tools.
    ToolCalls {
        tool_calls: Vec<ToolCall>,
        /// Optional text content alongside tool calls.
        content: Option<String>,
    },
}

/// Output from a respond_with_tools call.
#[derive(Debug)]
pub struct RespondOutput {
    pub result: RespondResult,
    pub usage: TokenUsage,
}

/// Reasoning layer that wraps an LLM provider.
pub struct Reasoning {
    llm: Arc<dyn LlmProvider>,
    system_prompt: Option<String>,
}

impl Reasoning {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    /// Call the LLM with tool definitions, returning either text or tool calls.
    pub async fn respond_with_tools(
        &self,
        context: &ReasoningContext,
    ) -> Result<RespondOutput, LlmError> {
        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(ref prompt) = self.system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(context.messages.iter().cloned());

        if context.tools.is_empty() {
            let response = self.llm.complete(CompletionRequest::new(messages)).await?;
            return Ok(RespondOutput {
                result: RespondResult::Text(response.content),
                usage: TokenUsage {
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                },
            });
        }

        let request = ToolCompletionRequest::new(messages, context.tools.clone());

        let response = self.llm.complete_with_tools(request).await?;
        let usage = TokenUsage {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        };

        let result = if response.tool_calls.is_empty() {
            RespondResult::Text(response.content.unwrap_or_default())
        } else {
            RespondResult::ToolCalls {
                tool_calls: response.tool_calls,
                content: response.content,
            }
        };

        Ok(RespondOutput { result, usage })
    }
}
