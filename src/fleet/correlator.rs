//! Task correlator: matches worker replies to awaiting callers.
//!
//! Each submitted task owns a oneshot completion held in the pending map.
//! Whoever removes the entry from the map (resolve, reject, or the deadline)
//! is the only party allowed to finish the task, so a task is resolved
//! exactly once and late replies find nothing to complete.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::fleet::model::{Task, TaskOutcome, TaskStatus, TaskType};
use crate::fleet::registry::WorkerRegistry;

type Completion = oneshot::Sender<Result<String, TaskError>>;

/// In-memory link between a submitted task and its waiting caller.
struct PendingCorrelation {
    worker_id: Uuid,
    created_at: DateTime<Utc>,
    completion: Completion,
}

/// Capped log of recent tasks, oldest evicted first.
struct TaskHistory {
    tasks: VecDeque<Task>,
    cap: usize,
}

impl TaskHistory {
    fn new(cap: usize) -> Self {
        Self {
            tasks: VecDeque::with_capacity(cap.min(1024)),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, task: Task) {
        while self.tasks.len() >= self.cap {
            self.tasks.pop_front();
        }
        self.tasks.push_back(task);
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().rev().find(|t| t.id == id)
    }
}

pub struct TaskCorrelator {
    registry: Arc<WorkerRegistry>,
    pending: Mutex<HashMap<Uuid, PendingCorrelation>>,
    history: Mutex<TaskHistory>,
    default_timeout: Duration,
}

impl TaskCorrelator {
    pub fn new(registry: Arc<WorkerRegistry>, history_cap: usize, default_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(TaskHistory::new(history_cap)),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Create a pending task and record it in the history log.
    ///
    /// Does not contact the worker.
    pub fn create_task(
        &self,
        worker_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Task {
        let timeout_ms = timeout.unwrap_or(self.default_timeout).as_millis() as u64;
        let task = Task::new(worker_id, task_type, payload, timeout_ms);
        if let Ok(mut history) = self.history.lock() {
            history.push(task.clone());
        }
        debug!(task_id = %task.id, worker_id = %worker_id, task_type = %task_type, "Task created");
        task
    }

    /// Hand a task to its worker and wait for the reply or the deadline.
    pub async fn submit(&self, task: &Task) -> Result<String, TaskError> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&task.id) {
                return Err(TaskError::Failed {
                    task_id: task.id,
                    reason: "task already submitted".to_string(),
                });
            }
            pending.insert(
                task.id,
                PendingCorrelation {
                    worker_id: task.worker_id,
                    created_at: task.created_at,
                    completion: tx,
                },
            );
        }
        let mut guard = PendingGuard {
            correlator: self,
            task_id: task.id,
            armed: true,
        };

        let connection = self
            .registry
            .get(task.worker_id)
            .await
            .and_then(|w| w.connection);
        let sent = connection.is_some_and(|c| c.send(task.request()));
        if !sent {
            guard.armed = false;
            if self.take_pending(task.id).is_some() {
                self.finish(
                    task.id,
                    TaskStatus::Failed,
                    None,
                    Some("worker not connected".to_string()),
                );
            }
            return Err(TaskError::NotConnected {
                worker_id: task.worker_id,
            });
        }
        self.mark_running(task.id);
        debug!(task_id = %task.id, worker_id = %task.worker_id, "Task dispatched");

        let deadline = Duration::from_millis(task.timeout_ms);
        let outcome = tokio::time::timeout(deadline, &mut rx).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Abandoned { task_id: task.id }),
            Err(_) => match self.take_pending(task.id) {
                Some(correlation) => {
                    let message = format!("timed out after {}ms", task.timeout_ms);
                    self.finish(task.id, TaskStatus::Timeout, None, Some(message));
                    warn!(task_id = %task.id, worker_id = %task.worker_id, timeout_ms = task.timeout_ms, "Task timed out");
                    self.record_stats(correlation.worker_id, TaskOutcome::Failure)
                        .await;
                    Err(TaskError::Timeout {
                        task_id: task.id,
                        timeout_ms: task.timeout_ms,
                    })
                }
                // A reply claimed the correlation as the deadline fired; its
                // outcome is on the way.
                None => rx.await.unwrap_or(Err(TaskError::Abandoned { task_id: task.id })),
            },
        }
    }

    /// Complete a task with the worker's result. Returns false if the task
    /// is unknown or already resolved (late results are discarded).
    pub async fn resolve(&self, task_id: Uuid, result: String) -> bool {
        let Some(correlation) = self.take_pending(task_id) else {
            debug!(task_id = %task_id, "Discarding result for unknown or resolved task");
            return false;
        };

        self.finish(task_id, TaskStatus::Completed, Some(result.clone()), None);
        let latency_ms = (Utc::now() - correlation.created_at).num_milliseconds().max(0) as f64;
        info!(task_id = %task_id, worker_id = %correlation.worker_id, latency_ms, "Task completed");
        self.record_stats(correlation.worker_id, TaskOutcome::Success { latency_ms })
            .await;

        let _ = correlation.completion.send(Ok(result));
        true
    }

    /// Fail a task with a worker-reported error.
    pub async fn reject(&self, task_id: Uuid, error: String) -> bool {
        let Some(correlation) = self.take_pending(task_id) else {
            debug!(task_id = %task_id, "Discarding error for unknown or resolved task");
            return false;
        };

        self.finish(task_id, TaskStatus::Failed, None, Some(error.clone()));
        warn!(task_id = %task_id, worker_id = %correlation.worker_id, error = %error, "Task failed");
        self.record_stats(correlation.worker_id, TaskOutcome::Failure)
            .await;

        let _ = correlation.completion.send(Err(TaskError::Failed {
            task_id,
            reason: error,
        }));
        true
    }

    /// Abandon every pending task, e.g. at shutdown.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(Uuid, PendingCorrelation)> = self.lock_pending().drain().collect();
        let count = drained.len();
        for (task_id, correlation) in drained {
            self.finish(
                task_id,
                TaskStatus::Failed,
                None,
                Some("relay shutting down".to_string()),
            );
            let _ = correlation
                .completion
                .send(Err(TaskError::Abandoned { task_id }));
        }
        if count > 0 {
            info!(count, "Abandoned pending tasks at shutdown");
        }
        count
    }

    /// Current state of a task, if still in the history log.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.history
            .lock()
            .ok()
            .and_then(|mut h| h.get_mut(task_id).map(|t| t.clone()))
    }

    /// Recent tasks, oldest first, optionally for one worker.
    pub fn history(&self, worker_id: Option<Uuid>) -> Vec<Task> {
        self.history
            .lock()
            .map(|h| {
                h.tasks
                    .iter()
                    .filter(|t| worker_id.is_none_or(|id| t.worker_id == id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingCorrelation>> {
        // The map holds no invariants a panicking holder could break halfway.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_pending(&self, task_id: Uuid) -> Option<PendingCorrelation> {
        self.lock_pending().remove(&task_id)
    }

    fn mark_running(&self, task_id: Uuid) {
        if let Ok(mut history) = self.history.lock()
            && let Some(task) = history.get_mut(task_id)
            && task.status == TaskStatus::Pending
        {
            task.status = TaskStatus::Running;
        }
    }

    fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        if let Ok(mut history) = self.history.lock()
            && let Some(task) = history.get_mut(task_id)
        {
            task.finish(status, result, error);
        }
    }

    async fn record_stats(&self, worker_id: Uuid, outcome: TaskOutcome) {
        if let Err(e) = self.registry.record_task_result(worker_id, outcome).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to record task stats");
        }
    }
}

/// Drops the correlation if the submitting future is cancelled mid-wait.
struct PendingGuard<'a> {
    correlator: &'a TaskCorrelator,
    task_id: Uuid,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.take_pending(self.task_id).is_some() {
            self.correlator.finish(
                self.task_id,
                TaskStatus::Failed,
                None,
                Some("caller stopped waiting".to_string()),
            );
        }
    }
}
