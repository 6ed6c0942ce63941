//! Tool dispatch table: one explicit mapping from tool name to handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::error::ToolError;
use crate::fleet::{TaskCorrelator, WorkerRegistry, WorkerSelector};
use crate::llm::ToolDefinition;
use crate::tools::builtin::fleet::{FleetDeps, ListWorkersTool, RemoteTaskTool, TaskHistoryTool};
use crate::tools::tool::{Tool, ToolCategory};

/// A registered handler, tagged with its name and category.
#[derive(Clone)]
pub struct ToolEntry {
    pub name: String,
    pub category: ToolCategory,
    pub tool: Arc<dyn Tool>,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    fn entry(tool: Arc<dyn Tool>) -> ToolEntry {
        ToolEntry {
            name: tool.name().to_string(),
            category: tool.category(),
            tool,
        }
    }

    /// Register a tool. A name can only be registered once.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let entry = Self::entry(tool);
        let mut tools = self.tools.write().await;
        if tools.contains_key(&entry.name) {
            tracing::warn!(tool = %entry.name, "Rejected duplicate tool registration");
            return false;
        }
        tracing::debug!(tool = %entry.name, category = %entry.category, "Registered tool");
        tools.insert(entry.name.clone(), entry);
        true
    }

    /// Register a tool (sync version for startup).
    pub fn register_sync(&self, tool: Arc<dyn Tool>) -> bool {
        let entry = Self::entry(tool);
        match self.tools.try_write() {
            Ok(mut tools) if !tools.contains_key(&entry.name) => {
                tracing::debug!(tool = %entry.name, category = %entry.category, "Registered tool");
                tools.insert(entry.name.clone(), entry);
                true
            }
            _ => {
                tracing::warn!(tool = %entry.name, "Could not register tool");
                false
            }
        }
    }

    /// Register the remote execution and fleet inspection tools.
    pub fn register_fleet_tools(
        &self,
        registry: Arc<WorkerRegistry>,
        selector: Arc<WorkerSelector>,
        correlator: Arc<TaskCorrelator>,
    ) {
        let deps = FleetDeps {
            registry: Arc::clone(&registry),
            selector,
            correlator: Arc::clone(&correlator),
        };
        for tool in RemoteTaskTool::all(&deps) {
            self.register_sync(Arc::new(tool));
        }
        self.register_sync(Arc::new(ListWorkersTool::new(Arc::clone(&registry))));
        self.register_sync(Arc::new(
            TaskHistoryTool::new(correlator).with_registry(registry),
        ));
    }

    /// Unregister a tool.
    pub async fn unregister(&self, name: &str) -> Option<ToolEntry> {
        self.tools.write().await.remove(name)
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<ToolEntry> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// List all tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Tool definitions for LLM function calling, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools.values().map(definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Tool definitions for one category, sorted by name.
    pub async fn tool_definitions_for_category(&self, category: ToolCategory) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|entry| entry.category == category)
            .map(definition)
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Invoke a tool by name and render its output as text.
    pub async fn dispatch(&self, name: &str, params: serde_json::Value) -> Result<String, ToolError> {
        let entry = self.get(name).await.ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        tracing::debug!(tool = %name, category = %entry.category, params = %params, "Tool call started");

        let timeout = entry.tool.execution_timeout();
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, entry.tool.execute(params)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(tool = %name, elapsed_ms, "Tool call succeeded");
                Ok(output.into_text())
            }
            Ok(Err(e)) => {
                tracing::debug!(tool = %name, elapsed_ms, error = %e, "Tool call failed");
                Err(e)
            }
            Err(_) => {
                tracing::debug!(tool = %name, elapsed_ms, "Tool call timed out");
                Err(ToolError::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn definition(entry: &ToolEntry) -> ToolDefinition {
    ToolDefinition {
        name: entry.name.clone(),
        description: entry.tool.description().to_string(),
        parameters: entry.tool.parameters_schema(),
    }
}
