//! Error types for the fleet relay.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type, returned while assembling the relay.
///
/// Once running, model, tool and task failures are turned into text for the
/// conversation instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rejected the request payload: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Whether the provider refused the request because of its shape or size.
    ///
    /// These are recoverable by shrinking the conversation and retrying.
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::ContextLengthExceeded { .. }
        )
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Worker {id} not found")]
    WorkerNotFound { id: Uuid },

    #[error("Failed to persist worker directory to {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote task errors, surfaced to whoever awaits a submitted task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: Uuid, timeout_ms: u64 },

    #[error("Task {task_id} failed: {reason}")]
    Failed { task_id: Uuid, reason: String },

    #[error("Worker {worker_id} is not connected")]
    NotConnected { worker_id: Uuid },

    #[error("Task {task_id} was abandoned before a result arrived")]
    Abandoned { task_id: Uuid },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_errors_are_classified() {
        let invalid = LlmError::InvalidRequest {
            provider: "anthropic".into(),
            reason: "messages: roles must alternate".into(),
        };
        assert!(invalid.is_payload_error());

        let too_long = LlmError::ContextLengthExceeded {
            used: 250_000,
            limit: 200_000,
        };
        assert!(too_long.is_payload_error());

        let auth = LlmError::AuthFailed {
            provider: "anthropic".into(),
        };
        assert!(!auth.is_payload_error());
    }

    #[test]
    fn timeout_message_names_budget() {
        let id = Uuid::new_v4();
        let err = TaskError::Timeout {
            task_id: id,
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), format!("Task {id} timed out after 50ms"));
    }
}
