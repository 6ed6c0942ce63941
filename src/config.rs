//! Configuration types.
//!
//! Everything is read from the environment with sensible defaults, so the
//! relay starts with no configuration at all (the model is then reported as
//! not configured).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default system prompt for the conversation loop.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a relay assistant that can act on a fleet of \
remote machines (workers). Use the fleet tools to run commands, read and write files, take \
screenshots, and inspect systems. Prefer list_workers when you are unsure what is available. \
When a tool reports an error, explain it briefly and decide whether another approach makes sense.";

/// Conversation loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name for identification in logs.
    pub name: String,
    /// Maximum model rounds per user turn.
    pub max_rounds: usize,
    /// Maximum messages retained per conversation.
    pub max_history: usize,
    /// Maximum characters of a single tool result fed back to the model.
    pub tool_output_cap: usize,
    /// Messages kept when history is trimmed after a rejected request.
    pub retry_keep_messages: usize,
    /// System prompt sent with every request.
    pub system_prompt: Option<String>,
    /// Most conversations kept in memory at once.
    pub max_conversations: usize,
    /// Conversations unused for this long are dropped.
    pub conversation_idle: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "fleet-relay".to_string(),
            max_rounds: 10,
            max_history: 40,
            tool_output_cap: 8_000,
            retry_keep_messages: 6,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            max_conversations: 256,
            conversation_idle: Duration::from_secs(60 * 60),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let idle_secs: u64 = env_or(
            "RELAY_CONVERSATION_IDLE_SECS",
            defaults.conversation_idle.as_secs(),
        )?;
        let config = Self {
            name: defaults.name,
            max_rounds: env_or("RELAY_MAX_ROUNDS", defaults.max_rounds)?,
            max_history: env_or("RELAY_MAX_HISTORY", defaults.max_history)?,
            tool_output_cap: env_or("RELAY_TOOL_OUTPUT_CAP", defaults.tool_output_cap)?,
            retry_keep_messages: env_or("RELAY_RETRY_KEEP", defaults.retry_keep_messages)?,
            system_prompt: std::env::var("RELAY_SYSTEM_PROMPT")
                .ok()
                .or(defaults.system_prompt),
            max_conversations: env_or("RELAY_MAX_CONVERSATIONS", defaults.max_conversations)?,
            conversation_idle: Duration::from_secs(idle_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the conversation loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(invalid("RELAY_MAX_ROUNDS", "must be at least 1"));
        }
        if self.max_history < 2 {
            return Err(invalid("RELAY_MAX_HISTORY", "must be at least 2"));
        }
        if self.retry_keep_messages == 0 || self.retry_keep_messages >= self.max_history {
            return Err(invalid(
                "RELAY_RETRY_KEEP",
                format!("must be between 1 and {}", self.max_history - 1),
            ));
        }
        if self.max_conversations == 0 {
            return Err(invalid("RELAY_MAX_CONVERSATIONS", "must be at least 1"));
        }
        Ok(())
    }
}

/// Worker fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Path of the persisted worker directory.
    pub workers_path: PathBuf,
    /// Number of resolved tasks retained for diagnostics.
    pub task_history: usize,
    /// Deadline applied to remote tasks when the caller gives none.
    pub default_task_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            workers_path: PathBuf::from("./data/workers.json"),
            task_history: 200,
            default_task_timeout: Duration::from_millis(30_000),
        }
    }
}

impl FleetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_ms: u64 = env_or(
            "RELAY_TASK_TIMEOUT_MS",
            defaults.default_task_timeout.as_millis() as u64,
        )?;
        let config = Self {
            workers_path: std::env::var("RELAY_WORKERS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.workers_path),
            task_history: env_or("RELAY_TASK_HISTORY", defaults.task_history)?,
            default_task_timeout: Duration::from_millis(timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_task_timeout.is_zero() {
            return Err(invalid("RELAY_TASK_TIMEOUT_MS", "must be greater than 0"));
        }
        Ok(())
    }
}

/// HTTP / WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_or("RELAY_PORT", Self::default().port)?,
        })
    }
}

/// Model credentials. Absent credentials are not an error at startup.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Messages API root, for proxies and gateways.
    pub base_url: Option<String>,
}

impl ModelConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: std::env::var("RELAY_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .ok()
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
