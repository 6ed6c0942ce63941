//! The `Tool` trait and parameter helpers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Default execution budget for a tool call.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Category a tool is filed under in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Fleet inspection (listing workers, task history).
    Fleet,
    /// Remote command execution.
    Command,
    /// Remote file access.
    Filesystem,
    /// Remote desktop control and screenshots.
    Desktop,
    /// Remote system inspection and custom actions.
    System,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fleet => "fleet",
            Self::Command => "command",
            Self::Filesystem => "filesystem",
            Self::Desktop => "desktop",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Output of a tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Render for the model: strings as-is, everything else as pretty JSON.
    pub fn into_text(self) -> String {
        match self.result {
            serde_json::Value::String(s) => s,
            other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    fn category(&self) -> ToolCategory;

    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;
}

fn invalid(tool: &str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidParameters {
        name: tool.to_string(),
        reason: reason.into(),
    }
}

/// Required non-empty string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    match params.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(serde_json::Value::String(_)) => Err(invalid(tool, format!("'{key}' must not be empty"))),
        Some(_) => Err(invalid(tool, format!("'{key}' must be a string"))),
        None => Err(invalid(tool, format!("missing required parameter '{key}'"))),
    }
}

/// Optional string parameter (empty strings count as absent).
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Optional unsigned integer parameter.
pub fn optional_u64(tool: &str, params: &serde_json::Value, key: &str) -> Result<Option<u64>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(tool, format!("'{key}' must be a non-negative integer"))),
    }
}

/// Optional list of strings; a single string is accepted as a one-item list.
pub fn optional_str_list(
    tool: &str,
    params: &serde_json::Value,
    key: &str,
) -> Result<Vec<String>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(tool, format!("'{key}' must contain only strings")))
            })
            .collect(),
        Some(_) => Err(invalid(tool, format!("'{key}' must be a list of strings"))),
    }
}
