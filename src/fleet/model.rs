//! Worker and task types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Smoothing factor for the rolling latency average.
const LATENCY_SMOOTHING: f64 = 0.2;

/// Connectivity state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl WorkerStatus {
    /// Connected and able to accept work (busy workers still qualify).
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// What a worker reports about itself at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub ram_gb: f64,
    #[serde(default)]
    pub cpu: String,
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    /// Declared tool categories, e.g. "command", "desktop", "filesystem".
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Capabilities {
    pub fn supports(&self, category: &str) -> bool {
        self.tools.iter().any(|t| t.eq_ignore_ascii_case(category))
    }
}

/// A unit of work sent down a live worker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub timeout_ms: u64,
}

/// Handle to a worker's live connection.
///
/// Identity is the connection id; the sender feeds the transport task that
/// owns the socket. Never persisted.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<TaskRequest>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Hand a request to the transport. Returns false if the connection is gone.
    pub fn send(&self, request: TaskRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A registered remote execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    #[serde(skip)]
    pub connection: Option<ConnectionHandle>,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub task_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub avg_latency_ms: f64,
}

impl Worker {
    /// A freshly registered worker: offline, zeroed counters, new id.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Capabilities,
        tags: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            capabilities,
            status: WorkerStatus::Offline,
            connection: None,
            last_seen: now,
            registered_at: now,
            tags: normalize_tags(tags),
            task_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.capabilities.hostname
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Fraction of completed tasks that failed, if any ran.
    pub fn error_rate(&self) -> Option<f64> {
        (self.task_count > 0).then(|| self.error_count as f64 / self.task_count as f64)
    }

    /// Fold one task resolution into the worker's stats.
    ///
    /// The latency average is seeded by the first successful sample and then
    /// smoothed; failures bump the error counter and leave latency alone.
    pub fn record_outcome(&mut self, outcome: TaskOutcome) {
        self.task_count += 1;
        match outcome {
            TaskOutcome::Success { latency_ms } => {
                let successes = self.task_count - self.error_count;
                if successes == 1 {
                    self.avg_latency_ms = latency_ms;
                } else {
                    self.avg_latency_ms = self.avg_latency_ms * (1.0 - LATENCY_SMOOTHING)
                        + latency_ms * LATENCY_SMOOTHING;
                }
            }
            TaskOutcome::Failure => self.error_count += 1,
        }
    }
}

/// Trim, dedupe (case-insensitively) and drop empty tags.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            out.push(tag.to_string());
        }
    }
    out
}

/// How a task ended, as far as worker stats are concerned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskOutcome {
    Success { latency_ms: f64 },
    Failure,
}

/// Kind of remote work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Command,
    Screenshot,
    FileRead,
    FileWrite,
    DesktopAction,
    SystemInfo,
    Custom,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        Self::Command,
        Self::Screenshot,
        Self::FileRead,
        Self::FileWrite,
        Self::DesktopAction,
        Self::SystemInfo,
        Self::Custom,
    ];

    /// Tool category a worker must declare to be preferred for this type.
    pub fn required_category(&self) -> Option<&'static str> {
        match self {
            Self::Screenshot | Self::DesktopAction => Some("desktop"),
            Self::Command => Some("command"),
            Self::FileRead | Self::FileWrite => Some("filesystem"),
            Self::SystemInfo | Self::Custom => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Screenshot => "screenshot",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::DesktopAction => "desktop_action",
            Self::SystemInfo => "system_info",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a task. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// One unit of requested remote work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
}

impl Task {
    pub fn new(
        worker_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            timeout_ms,
        }
    }

    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            task_id: self.id,
            task_type: self.task_type,
            payload: self.payload.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    /// Move to a terminal state. Returns false if already terminal.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::new(
            "Garage-PC",
            "",
            Capabilities {
                hostname: "garage".into(),
                ..Default::default()
            },
            vec![],
        )
    }

    #[test]
    fn first_success_seeds_latency() {
        let mut w = worker();
        w.record_outcome(TaskOutcome::Success { latency_ms: 420.0 });
        assert_eq!(w.task_count, 1);
        assert_eq!(w.avg_latency_ms, 420.0);

        w.record_outcome(TaskOutcome::Success { latency_ms: 920.0 });
        assert_eq!(w.task_count, 2);
        assert!((w.avg_latency_ms - (420.0 * 0.8 + 920.0 * 0.2)).abs() < 1e-9);
    }

    #[test]
    fn failure_counts_without_latency_sample() {
        let mut w = worker();
        w.record_outcome(TaskOutcome::Failure);
        assert_eq!(w.task_count, 1);
        assert_eq!(w.error_count, 1);
        assert_eq!(w.avg_latency_ms, 0.0);

        // The first success after a failure still seeds the average.
        w.record_outcome(TaskOutcome::Success { latency_ms: 300.0 });
        assert_eq!(w.avg_latency_ms, 300.0);
        assert_eq!(w.error_rate(), Some(0.5));
    }

    #[test]
    fn terminal_task_is_immutable() {
        let mut task = Task::new(Uuid::new_v4(), TaskType::Command, serde_json::json!({}), 50);
        assert!(task.finish(TaskStatus::Timeout, None, Some("timed out".into())));
        assert!(!task.finish(TaskStatus::Completed, Some("late".into()), None));
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.result.is_none());
    }

    #[test]
    fn category_mapping() {
        assert_eq!(TaskType::Screenshot.required_category(), Some("desktop"));
        assert_eq!(TaskType::DesktopAction.required_category(), Some("desktop"));
        assert_eq!(TaskType::FileWrite.required_category(), Some("filesystem"));
        assert_eq!(TaskType::Command.required_category(), Some("command"));
        assert_eq!(TaskType::SystemInfo.required_category(), None);
    }

    #[test]
    fn tags_are_normalized() {
        let tags = normalize_tags(vec![" gpu ".into(), "GPU".into(), "".into(), "home".into()]);
        assert_eq!(tags, vec!["gpu".to_string(), "home".to_string()]);
    }

    #[test]
    fn connection_is_not_serialized() {
        let mut w = worker();
        let (handle, _rx) = ConnectionHandle::new();
        w.connection = Some(handle);
        let json = serde_json::to_value(&w).unwrap();
        assert!(json.get("connection").is_none());
        let back: Worker = serde_json::from_value(json).unwrap();
        assert!(back.connection.is_none());
    }
}
