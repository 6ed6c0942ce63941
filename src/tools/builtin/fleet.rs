//! Fleet tools: remote execution on workers, plus fleet inspection.
//!
//! Remote tools route Registry → Selector → Correlator. Routing arguments
//! (`worker`, `tags`, `timeout_ms`) are stripped before the payload is sent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::error::{TaskError, ToolError};
use crate::fleet::{TaskCorrelator, TaskType, Worker, WorkerRegistry, WorkerSelector};
use crate::tools::tool::{
    Tool, ToolCategory, ToolOutput, optional_str, optional_str_list, optional_u64, require_str,
};

/// Longest deadline a caller may ask for.
const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Slack on top of the task deadline before the dispatch table gives up.
const DISPATCH_MARGIN: Duration = Duration::from_secs(5);

const ROUTING_KEYS: [&str; 3] = ["worker", "tags", "timeout_ms"];

/// Default number of tasks reported by `task_history`.
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Longest result preview in `task_history`.
const RESULT_PREVIEW_CHARS: usize = 200;

/// Shared handles the fleet tools route through.
#[derive(Clone)]
pub struct FleetDeps {
    pub registry: Arc<WorkerRegistry>,
    pub selector: Arc<WorkerSelector>,
    pub correlator: Arc<TaskCorrelator>,
}

/// Runs one kind of task on a worker.
pub struct RemoteTaskTool {
    task_type: TaskType,
    deps: FleetDeps,
}

impl RemoteTaskTool {
    pub fn new(task_type: TaskType, deps: &FleetDeps) -> Self {
        Self {
            task_type,
            deps: deps.clone(),
        }
    }

    /// One tool per task type.
    pub fn all(deps: &FleetDeps) -> Vec<Self> {
        TaskType::ALL.iter().map(|t| Self::new(*t, deps)).collect()
    }

    fn required_keys(&self) -> &'static [&'static str] {
        match self.task_type {
            TaskType::Command => &["command"],
            TaskType::FileRead => &["path"],
            TaskType::FileWrite => &["path", "content"],
            TaskType::DesktopAction | TaskType::Custom => &["action"],
            TaskType::Screenshot | TaskType::SystemInfo => &[],
        }
    }

    fn task_properties(&self) -> serde_json::Value {
        match self.task_type {
            TaskType::Command => json!({
                "command": { "type": "string", "description": "Shell command to run" },
                "cwd": { "type": "string", "description": "Working directory (optional)" }
            }),
            TaskType::Screenshot => json!({
                "display": { "type": "integer", "description": "Display index (optional)" }
            }),
            TaskType::FileRead => json!({
                "path": { "type": "string", "description": "Absolute path on the worker" }
            }),
            TaskType::FileWrite => json!({
                "path": { "type": "string", "description": "Absolute path on the worker" },
                "content": { "type": "string", "description": "Full file contents to write" }
            }),
            TaskType::DesktopAction => json!({
                "action": {
                    "type": "string",
                    "description": "Action to perform, e.g. click, type, key, open_app"
                },
                "target": { "type": "string", "description": "Element, app or key the action applies to" },
                "text": { "type": "string", "description": "Text to type (for type actions)" }
            }),
            TaskType::SystemInfo => json!({}),
            TaskType::Custom => json!({
                "action": { "type": "string", "description": "Worker-defined action name" },
                "args": { "type": "object", "description": "Arguments for the action" }
            }),
        }
    }

    /// Resolve the worker to run on. `Err` carries a user-facing message.
    async fn route(&self, worker_key: Option<&str>, tags: &[String]) -> Result<Worker, String> {
        let Some(key) = worker_key else {
            return self
                .deps
                .selector
                .select_best(self.task_type, tags)
                .await
                .ok_or_else(|| format!("No worker available for {} tasks", self.task_type));
        };

        let worker = self
            .deps
            .registry
            .find(key)
            .await
            .ok_or_else(|| format!("No worker named '{key}'"))?;
        if worker.connection.is_none() || !worker.status.is_available() {
            return Err(format!("Worker '{}' is {}", worker.name, worker.status));
        }
        Ok(worker)
    }
}

fn strip_routing_keys(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(k, _)| !ROUTING_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => json!({}),
    }
}

fn tool_name(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Command => "run_command",
        TaskType::Screenshot => "take_screenshot",
        TaskType::FileRead => "read_remote_file",
        TaskType::FileWrite => "write_remote_file",
        TaskType::DesktopAction => "desktop_action",
        TaskType::SystemInfo => "system_info",
        TaskType::Custom => "custom_task",
    }
}

#[async_trait]
impl Tool for RemoteTaskTool {
    fn name(&self) -> &str {
        tool_name(self.task_type)
    }

    fn description(&self) -> &str {
        match self.task_type {
            TaskType::Command => {
                "Run a shell command on a remote worker and return its output. \
                 The best connected worker is chosen unless `worker` names one."
            }
            TaskType::Screenshot => "Capture a screenshot on a remote worker.",
            TaskType::FileRead => "Read a file from a remote worker.",
            TaskType::FileWrite => "Write a file on a remote worker, replacing its contents.",
            TaskType::DesktopAction => {
                "Perform a desktop action (click, type, key press, open an app) on a remote worker."
            }
            TaskType::SystemInfo => "Report OS, CPU, memory and disk details of a remote worker.",
            TaskType::Custom => "Run a worker-defined custom action on a remote worker.",
        }
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = self.task_properties();
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "worker".into(),
                json!({ "type": "string", "description": "Worker id or name to target (optional)" }),
            );
            map.insert(
                "tags".into(),
                json!({
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Preferred worker tags (optional)"
                }),
            );
            map.insert(
                "timeout_ms".into(),
                json!({ "type": "integer", "description": "Task deadline in milliseconds (optional)" }),
            );
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_keys(),
        })
    }

    fn category(&self) -> ToolCategory {
        match self.task_type {
            TaskType::Command => ToolCategory::Command,
            TaskType::FileRead | TaskType::FileWrite => ToolCategory::Filesystem,
            TaskType::Screenshot | TaskType::DesktopAction => ToolCategory::Desktop,
            TaskType::SystemInfo | TaskType::Custom => ToolCategory::System,
        }
    }

    fn execution_timeout(&self) -> Duration {
        MAX_TASK_TIMEOUT + DISPATCH_MARGIN
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let name = self.name();
        for key in self.required_keys() {
            require_str(name, &params, key)?;
        }
        let tags = optional_str_list(name, &params, "tags")?;
        let timeout = optional_u64(name, &params, "timeout_ms")?
            .map(|ms| Duration::from_millis(ms.max(1)).min(MAX_TASK_TIMEOUT))
            .unwrap_or_else(|| self.deps.correlator.default_timeout());

        let start = Instant::now();
        let worker = match self.route(optional_str(&params, "worker"), &tags).await {
            Ok(w) => w,
            Err(message) => {
                tracing::info!(tool = %name, "{message}");
                return Ok(ToolOutput::text(message, start.elapsed()));
            }
        };

        let task = self.deps.correlator.create_task(
            worker.id,
            self.task_type,
            strip_routing_keys(&params),
            Some(timeout),
        );
        tracing::debug!(tool = %name, task_id = %task.id, worker = %worker.name, "Submitting remote task");

        match self.deps.correlator.submit(&task).await {
            Ok(result) => Ok(ToolOutput::text(result, start.elapsed())),
            Err(TaskError::Timeout { timeout_ms, .. }) => Ok(ToolOutput::text(
                format!(
                    "Task on {} timed out after {timeout_ms}ms",
                    worker.name
                ),
                start.elapsed(),
            )),
            Err(TaskError::NotConnected { .. }) => Ok(ToolOutput::text(
                format!("Worker '{}' disconnected before the task was sent", worker.name),
                start.elapsed(),
            )),
            Err(e) => Err(ToolError::ExecutionFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Summarises the fleet for the model.
pub struct ListWorkersTool {
    registry: Arc<WorkerRegistry>,
}

impl ListWorkersTool {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }
}

fn worker_summary(worker: &Worker) -> serde_json::Value {
    json!({
        "id": worker.id,
        "name": worker.name,
        "hostname": worker.hostname(),
        "os": worker.capabilities.os,
        "status": worker.status,
        "connected": worker.connection.is_some(),
        "tools": worker.capabilities.tools,
        "tags": worker.tags,
        "task_count": worker.task_count,
        "error_count": worker.error_count,
        "avg_latency_ms": worker.avg_latency_ms.round(),
        "last_seen": worker.last_seen,
    })
}

#[async_trait]
impl Tool for ListWorkersTool {
    fn name(&self) -> &str {
        "list_workers"
    }

    fn description(&self) -> &str {
        "List registered workers with their status, declared tools, tags and performance stats."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "online_only": {
                    "type": "boolean",
                    "description": "Only list connected workers (default false)"
                }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Fleet
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let online_only = params
            .get("online_only")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let workers = if online_only {
            self.registry.list_online().await
        } else {
            self.registry.list().await
        };
        if workers.is_empty() {
            return Ok(ToolOutput::text("No workers registered.", start.elapsed()));
        }

        let summaries: Vec<serde_json::Value> = workers.iter().map(worker_summary).collect();
        Ok(ToolOutput::success(json!(summaries), start.elapsed()))
    }
}

/// Recent remote tasks, optionally for one worker.
pub struct TaskHistoryTool {
    registry: Option<Arc<WorkerRegistry>>,
    correlator: Arc<TaskCorrelator>,
}

impl TaskHistoryTool {
    pub fn new(correlator: Arc<TaskCorrelator>) -> Self {
        Self {
            registry: None,
            correlator,
        }
    }

    /// Allow filtering by worker name as well as id.
    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(RESULT_PREVIEW_CHARS).collect();
    format!("{cut}...")
}

#[async_trait]
impl Tool for TaskHistoryTool {
    fn name(&self) -> &str {
        "task_history"
    }

    fn description(&self) -> &str {
        "Show recent remote tasks (newest last) with status, result preview and errors."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "worker": { "type": "string", "description": "Worker id or name (optional)" },
                "limit": { "type": "integer", "description": "Maximum tasks to return (default 20)" }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Fleet
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let limit = optional_u64(self.name(), &params, "limit")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_HISTORY_LIMIT);

        let worker_id = match optional_str(&params, "worker") {
            None => None,
            Some(key) => {
                let found = match &self.registry {
                    Some(registry) => registry.find(key).await.map(|w| w.id),
                    None => uuid::Uuid::parse_str(key).ok(),
                };
                match found {
                    Some(id) => Some(id),
                    None => {
                        return Ok(ToolOutput::text(
                            format!("No worker named '{key}'"),
                            start.elapsed(),
                        ));
                    }
                }
            }
        };

        let tasks = self.correlator.history(worker_id);
        if tasks.is_empty() {
            return Ok(ToolOutput::text("No tasks recorded.", start.elapsed()));
        }
        let skip = tasks.len().saturating_sub(limit);
        let entries: Vec<serde_json::Value> = tasks
            .iter()
            .skip(skip)
            .map(|t| {
                json!({
                    "id": t.id,
                    "worker_id": t.worker_id,
                    "task_type": t.task_type,
                    "status": t.status,
                    "result": t.result.as_deref().map(preview),
                    "error": t.error,
                    "created_at": t.created_at,
                    "completed_at": t.completed_at,
                })
            })
            .collect();
        Ok(ToolOutput::success(json!(entries), start.elapsed()))
    }
}
