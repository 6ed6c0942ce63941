//! Conversation loop: ask the model, run requested tools, feed results back.
//!
//! Each user turn runs at most `max_rounds` model calls. Tools requested in
//! one round run sequentially, in request order, and every result (errors
//! included) goes back to the model as a tool message. Conversations are
//! independent: each has its own lock, so different conversations progress
//! concurrently while one conversation handles a single turn at a time.
//!
//! The conversation map is bounded: idle conversations are dropped, then
//! the least recently used, whenever a new one needs room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};

use crate::agent::history::ConversationHistory;
use crate::config::{AgentConfig, DEFAULT_SYSTEM_PROMPT};
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, LlmProvider, Reasoning, ReasoningContext, RespondOutput, RespondResult,
    TokenUsage, ToolCall, ToolDefinition,
};
use crate::tools::ToolRegistry;

/// Reply when no model credentials are configured.
pub const NOT_CONFIGURED: &str =
    "The assistant is not configured. Set ANTHROPIC_API_KEY and restart the relay.";

/// Reply when the model rejects the conversation even after trimming.
pub const HISTORY_CLEARED: &str = "This conversation grew too long for the model, so its \
history has been cleared. Please repeat your last request.";

/// Reply when the round budget runs out before the model produced any text.
pub const ROUNDS_EXHAUSTED: &str = "I ran the requested actions but stopped before writing a \
summary. Ask me to continue if you need more.";

/// Cut a tool result to `cap` characters, marking how much there was.
pub fn truncate_tool_output(output: &str, cap: usize) -> String {
    let total = output.chars().count();
    if total <= cap {
        return output.to_string();
    }
    let byte_offset = output
        .char_indices()
        .nth(cap)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    format!("{}\n[Truncated: {total} chars total]", &output[..byte_offset])
}

/// Core dependencies for the agent.
pub struct AgentDeps {
    /// `None` when no credentials are configured.
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tools: Arc<ToolRegistry>,
}

/// State of one conversation.
#[derive(Debug)]
struct Conversation {
    history: ConversationHistory,
    usage: TokenUsage,
    turns: u64,
}

/// A conversation and when it was last used.
struct ConversationEntry {
    state: Arc<Mutex<Conversation>>,
    last_used: Instant,
}

impl ConversationEntry {
    /// Held outside the map, i.e. mid-turn or being read.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.state) > 1
    }
}

/// Why a model call gave up for this turn.
enum ThinkError {
    /// Still rejected after trimming; history was cleared.
    HistoryCleared,
    Llm(LlmError),
}

/// The conversation loop controller.
pub struct Agent {
    config: AgentConfig,
    deps: AgentDeps,
    reasoning: Option<Reasoning>,
    conversations: RwLock<HashMap<String, ConversationEntry>>,
}

impl Agent {
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Self {
        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let reasoning = deps
            .llm
            .as_ref()
            .map(|llm| Reasoning::new(Arc::clone(llm)).with_system_prompt(Some(system_prompt)));
        if reasoning.is_none() {
            tracing::warn!(agent = %config.name, "No LLM configured; every turn will report it");
        }

        Self {
            config,
            deps,
            reasoning,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.reasoning.is_some()
    }

    async fn conversation(&self, conversation_id: &str) -> Arc<Mutex<Conversation>> {
        let mut conversations = self.conversations.write().await;
        let now = Instant::now();
        if let Some(entry) = conversations.get_mut(conversation_id) {
            entry.last_used = now;
            return Arc::clone(&entry.state);
        }

        self.evict(&mut conversations, now);
        tracing::debug!(conversation_id = %conversation_id, "New conversation");
        let state = Arc::new(Mutex::new(Conversation {
            history: ConversationHistory::new(self.config.max_history),
            usage: TokenUsage::default(),
            turns: 0,
        }));
        conversations.insert(
            conversation_id.to_string(),
            ConversationEntry {
                state: Arc::clone(&state),
                last_used: now,
            },
        );
        state
    }

    /// Make room for one more conversation. Entries in use are kept.
    fn evict(&self, conversations: &mut HashMap<String, ConversationEntry>, now: Instant) {
        let before = conversations.len();
        let idle = self.config.conversation_idle;
        conversations.retain(|_, entry| entry.in_use() || now.duration_since(entry.last_used) < idle);

        while conversations.len() >= self.config.max_conversations {
            let oldest = conversations
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    conversations.remove(&id);
                }
                None => break,
            }
        }

        let evicted = before - conversations.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = conversations.len(), "Evicted conversations");
        }
    }

    fn existing(
        conversations: &HashMap<String, ConversationEntry>,
        conversation_id: &str,
    ) -> Option<Arc<Mutex<Conversation>>> {
        conversations
            .get(conversation_id)
            .map(|entry| Arc::clone(&entry.state))
    }

    /// Handle one user turn and return the reply text.
    ///
    /// Never fails: model and tool errors come back as text.
    pub async fn handle_turn(&self, conversation_id: &str, input: &str) -> String {
        let Some(reasoning) = &self.reasoning else {
            return NOT_CONFIGURED.to_string();
        };

        let conversation = self.conversation(conversation_id).await;
        let mut conversation = conversation.lock().await;
        let start = Instant::now();

        let (reply, usage, rounds) = self
            .run_turn(reasoning, &mut conversation.history, input)
            .await;

        let dropped = conversation.history.enforce_cap();
        conversation.usage.add(usage);
        conversation.turns += 1;

        tracing::info!(
            conversation_id = %conversation_id,
            rounds,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost = %usage.cost(reasoning.llm().as_ref()),
            history = conversation.history.len(),
            dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Turn complete"
        );
        reply
    }

    async fn run_turn(
        &self,
        reasoning: &Reasoning,
        history: &mut ConversationHistory,
        input: &str,
    ) -> (String, TokenUsage, usize) {
        history.add(ChatMessage::user(input));
        let tools = self.deps.tools.tool_definitions().await;
        let mut usage = TokenUsage::default();
        let mut last_text: Option<String> = None;

        for round in 1..=self.config.max_rounds {
            let output = match self.think(reasoning, history, &tools).await {
                Ok(output) => output,
                Err(ThinkError::HistoryCleared) => {
                    return (HISTORY_CLEARED.to_string(), usage, round);
                }
                Err(ThinkError::Llm(e)) => {
                    tracing::error!(round, error = %e, "Model call failed");
                    history.rollback_last_turn();
                    history.sanitize();
                    return (format!("Sorry, the model request failed: {e}"), usage, round);
                }
            };
            usage.add(output.usage);

            match output.result {
                RespondResult::Text(text) => {
                    let reply = if text.trim().is_empty() {
                        last_text.unwrap_or_else(|| ROUNDS_EXHAUSTED.to_string())
                    } else {
                        text
                    };
                    history.add(ChatMessage::assistant(&reply));
                    return (reply, usage, round);
                }
                RespondResult::ToolCalls {
                    tool_calls,
                    content,
                } => {
                    let content = content.filter(|c| !c.trim().is_empty());
                    if let Some(ref text) = content {
                        last_text = Some(text.clone());
                    }
                    tracing::debug!(round, count = tool_calls.len(), "Executing tool calls");
                    history.add(ChatMessage::assistant_with_tool_calls(
                        content,
                        tool_calls.clone(),
                    ));
                    for call in &tool_calls {
                        let result = self.run_tool(call).await;
                        history.add(ChatMessage::tool_result(&call.id, &call.name, result));
                    }
                }
            }
        }

        tracing::warn!(
            max_rounds = self.config.max_rounds,
            "Round limit reached, ending turn"
        );
        let reply = last_text.unwrap_or_else(|| ROUNDS_EXHAUSTED.to_string());
        history.add(ChatMessage::assistant(&reply));
        (reply, usage, self.config.max_rounds)
    }

    /// One model call, with a single trimmed retry for payload rejections.
    async fn think(
        &self,
        reasoning: &Reasoning,
        history: &mut ConversationHistory,
        tools: &[ToolDefinition],
    ) -> Result<RespondOutput, ThinkError> {
        let context = ReasoningContext::new()
            .with_messages(history.messages().to_vec())
            .with_tools(tools.to_vec());
        let err = match reasoning.respond_with_tools(&context).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_payload_error() => e,
            Err(e) => return Err(ThinkError::Llm(e)),
        };

        tracing::warn!(
            error = %err,
            keep = self.config.retry_keep_messages,
            "Model rejected the request, retrying with trimmed history"
        );
        history.retain_recent(self.config.retry_keep_messages);
        let context = ReasoningContext::new()
            .with_messages(history.messages().to_vec())
            .with_tools(tools.to_vec());
        match reasoning.respond_with_tools(&context).await {
            Ok(output) => Ok(output),
            Err(e) => {
                tracing::warn!(error = %e, "Retry failed, clearing conversation history");
                history.clear();
                Err(ThinkError::HistoryCleared)
            }
        }
    }

    /// Run one tool. Failures become the text of the tool result.
    async fn run_tool(&self, call: &ToolCall) -> String {
        let start = Instant::now();
        let text = match self
            .deps
            .tools
            .dispatch(&call.name, call.arguments.clone())
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool failed");
                format!("Error: {e}")
            }
        };
        tracing::debug!(
            tool = %call.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Tool finished"
        );
        truncate_tool_output(&text, self.config.tool_output_cap)
    }

    /// Forget a conversation entirely. Returns false if it did not exist.
    pub async fn clear(&self, conversation_id: &str) -> bool {
        let removed = self.conversations.write().await.remove(conversation_id);
        if removed.is_some() {
            tracing::info!(conversation_id = %conversation_id, "Conversation cleared");
        }
        removed.is_some()
    }

    /// Snapshot of a conversation's history.
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<ChatMessage>> {
        let conversation = Self::existing(&*self.conversations.read().await, conversation_id)?;
        let conversation = conversation.lock().await;
        Some(conversation.history.messages().to_vec())
    }

    /// Accumulated token usage and turn count for a conversation.
    pub async fn usage(&self, conversation_id: &str) -> Option<(TokenUsage, u64)> {
        let conversation = Self::existing(&*self.conversations.read().await, conversation_id)?;
        let conversation = conversation.lock().await;
        Some((conversation.usage, conversation.turns))
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::ToolError;
    use crate::llm::{
        CompletionRequest, CompletionResponse, FinishReason, Role, ToolCompletionRequest,
        ToolCompletionResponse,
    };
    use crate::tools::{Tool, ToolCategory, ToolOutput};

    /// One scripted model reply.
    #[derive(Clone)]
    enum Step {
        Text(&'static str),
        Tools(Vec<(&'static str, serde_json::Value)>),
        PayloadError,
        ServerError,
    }

    /// Replays a script; the last step repeats once the script runs out.
    struct ScriptedLlm {
        script: std::sync::Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        seen: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Step {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or(Step::Text("done"))
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.000003), dec!(0.000015))
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: "done".into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.messages);
            let (content, tool_calls) = match self.next_step() {
                Step::Text(text) => (Some(text.to_string()), vec![]),
                Step::Tools(calls) => (
                    None,
                    calls
                        .into_iter()
                        .enumerate()
                        .map(|(i, (name, arguments))| ToolCall {
                            id: format!("call_{n}_{i}"),
                            name: name.to_string(),
                            arguments,
                        })
                        .collect(),
                ),
                Step::PayloadError => {
                    return Err(LlmError::InvalidRequest {
                        provider: "scripted".into(),
                        reason: "prompt is too long".into(),
                    });
                }
                Step::ServerError => {
                    return Err(LlmError::RequestFailed {
                        provider: "scripted".into(),
                        reason: "overloaded".into(),
                    });
                }
            };
            Ok(ToolCompletionResponse {
                content,
                tool_calls,
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    /// Echoes its `text` argument, or fails when asked to.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::System
        }
        async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
            let text = params["text"].as_str().unwrap_or_default();
            if text == "fail" {
                return Err(ToolError::ExecutionFailed {
                    name: "echo".into(),
                    reason: "handler exploded".into(),
                });
            }
            Ok(ToolOutput::text(text, Duration::ZERO))
        }
    }

    fn agent_with(llm: Arc<ScriptedLlm>, config: AgentConfig) -> Agent {
        let tools = Arc::new(ToolRegistry::new());
        tools.register_sync(Arc::new(EchoTool));
        Agent::new(
            config,
            AgentDeps {
                llm: Some(llm as Arc<dyn LlmProvider>),
                tools,
            },
        )
    }

    fn echo(text: &str) -> (&'static str, serde_json::Value) {
        ("echo", serde_json::json!({ "text": text }))
    }

    #[test]
    fn truncation_marks_total_length() {
        assert_eq!(truncate_tool_output("short", 10), "short");
        let long = "é".repeat(30);
        let cut = truncate_tool_output(&long, 10);
        assert!(cut.starts_with(&"é".repeat(10)));
        assert!(cut.ends_with("\n[Truncated: 30 chars total]"));
    }

    #[tokio::test]
    async fn not_configured_without_llm() {
        let agent = Agent::new(
            AgentConfig::default(),
            AgentDeps {
                llm: None,
                tools: Arc::new(ToolRegistry::new()),
            },
        );
        assert!(!agent.is_configured());
        assert_eq!(agent.handle_turn("c", "hello").await, NOT_CONFIGURED);
        assert_eq!(agent.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn text_reply_ends_turn() {
        let llm = ScriptedLlm::new(vec![Step::Text("Hi there")]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());

        assert_eq!(agent.handle_turn("c", "hello").await, "Hi there");
        assert_eq!(llm.calls(), 1);
        let history = agent.history("c").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);

        let (usage, turns) = agent.usage("c").await.unwrap();
        assert_eq!(usage.total(), 15);
        assert_eq!(turns, 1);
    }

    #[tokio::test]
    async fn failing_tool_does_not_abort_round() {
        let llm = ScriptedLlm::new(vec![
            Step::Tools(vec![echo("one"), echo("fail"), echo("three")]),
            Step::Text("All done"),
        ]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());

        assert_eq!(agent.handle_turn("c", "do three things").await, "All done");
        assert_eq!(llm.calls(), 2);

        // The second model call saw all three results, in request order.
        let seen = llm.seen.lock().unwrap();
        let results: Vec<&ChatMessage> = seen[1].iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "one");
        assert!(results[1].content.starts_with("Error: "));
        assert!(results[1].content.contains("handler exploded"));
        assert_eq!(results[2].content, "three");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let llm = ScriptedLlm::new(vec![
            Step::Tools(vec![("no_such_tool", serde_json::json!({}))]),
            Step::Text("ok"),
        ]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());
        agent.handle_turn("c", "try").await;

        let history = agent.history("c").await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(result.content, "Error: Tool no_such_tool not found");
    }

    #[tokio::test]
    async fn round_limit_bounds_the_turn() {
        let llm = ScriptedLlm::new(vec![Step::Tools(vec![echo("a"), echo("b")])]);
        let config = AgentConfig {
            max_rounds: 3,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);

        let reply = agent.handle_turn("c", "loop forever").await;
        assert_eq!(reply, ROUNDS_EXHAUSTED);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn round_limit_returns_last_text() {
        let llm = ScriptedLlm::new(vec![Step::Tools(vec![echo("a")])]);
        let config = AgentConfig {
            max_rounds: 2,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);
        // Tool-call steps carry no text, so the generic message is used.
        assert_eq!(agent.handle_turn("c", "go").await, ROUNDS_EXHAUSTED);
        let history = agent.history("c").await.unwrap();
        assert_eq!(history.last().unwrap().content, ROUNDS_EXHAUSTED);
    }

    #[tokio::test]
    async fn history_never_exceeds_cap() {
        let llm = ScriptedLlm::new(vec![
            Step::Tools(vec![echo("x")]),
            Step::Text("reply"),
        ]);
        let config = AgentConfig {
            max_history: 5,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);

        for i in 0..6 {
            agent.handle_turn("c", &format!("turn {i}")).await;
            let history = agent.history("c").await.unwrap();
            assert!(history.len() <= 5, "history grew to {}", history.len());
            assert_eq!(history[0].role, Role::User);
        }
    }

    #[tokio::test]
    async fn tool_output_is_truncated() {
        let long = "z".repeat(100);
        let llm = ScriptedLlm::new(vec![Step::Tools(vec![echo(&long)]), Step::Text("ok")]);
        let config = AgentConfig {
            tool_output_cap: 20,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);
        agent.handle_turn("c", "big").await;

        let history = agent.history("c").await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(
            result.content,
            format!("{}\n[Truncated: 100 chars total]", "z".repeat(20))
        );
    }

    #[tokio::test]
    async fn payload_error_trims_and_retries_once() {
        let llm = ScriptedLlm::new(vec![
            Step::Text("first"),
            Step::Text("second"),
            Step::PayloadError,
            Step::Text("recovered"),
        ]);
        let config = AgentConfig {
            retry_keep_messages: 1,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);
        agent.handle_turn("c", "one").await;
        agent.handle_turn("c", "two").await;

        assert_eq!(agent.handle_turn("c", "three").await, "recovered");
        assert_eq!(llm.calls(), 4);

        // The retry only carried the current request.
        let seen = llm.seen.lock().unwrap();
        let retried: Vec<&ChatMessage> = seen[3].iter().filter(|m| m.role != Role::System).collect();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].content, "three");
    }

    #[tokio::test]
    async fn failed_retry_clears_history() {
        let llm = ScriptedLlm::new(vec![Step::Text("hello"), Step::PayloadError]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());
        agent.handle_turn("c", "hi").await;

        assert_eq!(agent.handle_turn("c", "huge request").await, HISTORY_CLEARED);
        // Initial call plus exactly one retry.
        assert_eq!(llm.calls(), 3);
        assert!(agent.history("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_model_errors_become_text() {
        let llm = ScriptedLlm::new(vec![Step::Text("hello"), Step::ServerError]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());
        agent.handle_turn("c", "hi").await;

        let reply = agent.handle_turn("c", "again").await;
        assert!(reply.starts_with("Sorry, the model request failed"));
        assert_eq!(llm.calls(), 2);
        // The failed turn leaves no trace; earlier turns survive.
        let history = agent.history("c").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| !m.is_empty_assistant()));
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let llm = ScriptedLlm::new(vec![Step::Text("ok")]);
        let agent = agent_with(Arc::clone(&llm), AgentConfig::default());
        agent.handle_turn("a", "one").await;
        agent.handle_turn("b", "two").await;
        agent.handle_turn("b", "three").await;

        assert_eq!(agent.history("a").await.unwrap().len(), 2);
        assert_eq!(agent.history("b").await.unwrap().len(), 4);

        assert!(agent.clear("b").await);
        assert!(agent.history("b").await.is_none());
        assert_eq!(agent.conversation_count().await, 1);
        assert!(!agent.clear("missing").await);
    }

    #[tokio::test]
    async fn least_recently_used_conversation_is_evicted() {
        let llm = ScriptedLlm::new(vec![Step::Text("ok")]);
        let config = AgentConfig {
            max_conversations: 2,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);

        agent.handle_turn("a", "one").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        agent.handle_turn("b", "two").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        agent.handle_turn("a", "three").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        agent.handle_turn("c", "four").await;

        assert_eq!(agent.conversation_count().await, 2);
        assert!(agent.history("b").await.is_none());
        assert_eq!(agent.history("a").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn idle_conversations_are_dropped() {
        let llm = ScriptedLlm::new(vec![Step::Text("ok")]);
        let config = AgentConfig {
            conversation_idle: Duration::from_millis(10),
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);

        agent.handle_turn("stale", "hello").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        agent.handle_turn("fresh", "hello").await;

        assert_eq!(agent.conversation_count().await, 1);
        assert!(agent.history("stale").await.is_none());
    }

    #[tokio::test]
    async fn oversized_turn_survives_history_cap() {
        let llm = ScriptedLlm::new(vec![
            Step::Tools(vec![echo("a")]),
            Step::Tools(vec![echo("b")]),
            Step::Text("both done"),
        ]);
        let config = AgentConfig {
            max_history: 4,
            retry_keep_messages: 2,
            ..AgentConfig::default()
        };
        let agent = agent_with(Arc::clone(&llm), config);

        let reply = agent.handle_turn("c", "do a then b").await;
        assert_eq!(reply, "both done");

        let history = agent.history("c").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "do a then b");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history.last().unwrap().content, "both done");
    }
}
