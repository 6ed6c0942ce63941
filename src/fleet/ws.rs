//! WebSocket transport for workers + REST inspection endpoints.
//!
//! A worker connects to `/ws/worker`, sends `register`, and then receives
//! `task` messages and answers with `result` / `error`. Closing the socket
//! marks the worker offline.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fleet::correlator::TaskCorrelator;
use crate::fleet::model::{
    Capabilities, ConnectionHandle, TaskRequest, TaskType, WorkerStatus,
};
use crate::fleet::registry::{Registration, WorkerRegistry};

// ── JSON Protocol ───────────────────────────────────────────────────────

/// Message from worker → relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        name: String,
        #[serde(default)]
        description: String,
        capabilities: Capabilities,
        #[serde(default)]
        tags: Vec<String>,
    },
    Result {
        task_id: Uuid,
        result: String,
    },
    Error {
        task_id: Uuid,
        error: String,
    },
    Status {
        status: WorkerStatus,
    },
    Heartbeat,
}

/// Message from relay → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Registered {
        worker_id: Uuid,
    },
    Task {
        task_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        timeout_ms: u64,
    },
    Error {
        message: String,
    },
}

impl From<TaskRequest> for RelayMessage {
    fn from(request: TaskRequest) -> Self {
        Self::Task {
            task_id: request.task_id,
            task_type: request.task_type,
            payload: request.payload,
            timeout_ms: request.timeout_ms,
        }
    }
}

// ── Routes ──────────────────────────────────────────────────────────────

/// Application state shared across fleet handlers.
#[derive(Clone)]
pub struct FleetState {
    pub registry: Arc<WorkerRegistry>,
    pub correlator: Arc<TaskCorrelator>,
}

/// Build the Axum router with the worker WebSocket and fleet REST routes.
pub fn fleet_routes(registry: Arc<WorkerRegistry>, correlator: Arc<TaskCorrelator>) -> Router {
    let state = FleetState {
        registry,
        correlator,
    };

    Router::new()
        .route("/ws/worker", get(ws_handler))
        .route("/health", get(health))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{id}", delete(unregister_worker))
        .route("/api/tasks", get(list_tasks))
        .with_state(state)
}

async fn health(State(state): State<FleetState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fleet-relay",
        "workers_online": state.registry.list_online().await.len(),
        "tasks_pending": state.correlator.pending_count(),
    }))
}

async fn list_workers(State(state): State<FleetState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn unregister_worker(
    State(state): State<FleetState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.registry.unregister(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    worker_id: Option<Uuid>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<FleetState>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    let mut tasks = state.correlator.history(query.worker_id);
    if let Some(limit) = query.limit {
        let skip = tasks.len().saturating_sub(limit);
        tasks.drain(..skip);
    }
    Json(tasks)
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FleetState>) -> impl IntoResponse {
    debug!("Worker connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &RelayMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode relay message");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: FleetState) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut task_rx) = ConnectionHandle::new();
    let connection_id = handle.id();
    let mut worker_id: Option<Uuid> = None;

    loop {
        tokio::select! {
            Some(request) = task_rx.recv() => {
                let task_id = request.task_id;
                if !send(&mut sender, &RelayMessage::from(request)).await {
                    debug!(task_id = %task_id, "Worker disconnected during task send");
                    break;
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_worker_message(text.as_str(), &state, &handle, &mut worker_id).await;
                        if let Some(reply) = reply
                            && !send(&mut sender, &reply).await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Worker socket error");
                        break;
                    }
                }
            }
        }
    }

    // Only the transport's own handle is known here. set_offline clears the
    // handle even when persisting fails, so each worker is released once.
    while let Some(worker) = state.registry.find_by_connection(connection_id).await {
        info!(worker_id = %worker.id, name = %worker.name, "Worker disconnected");
        if let Err(e) = state.registry.set_offline(worker.id).await {
            warn!(worker_id = %worker.id, error = %e, "Failed to mark worker offline");
        }
    }
}

async fn handle_worker_message(
    text: &str,
    state: &FleetState,
    handle: &ConnectionHandle,
    worker_id: &mut Option<Uuid>,
) -> Option<RelayMessage> {
    let message: WorkerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Invalid worker message");
            return Some(RelayMessage::Error {
                message: format!("invalid message: {e}"),
            });
        }
    };

    if let WorkerMessage::Register {
        name,
        description,
        capabilities,
        tags,
    } = message
    {
        if capabilities.hostname.trim().is_empty() {
            return Some(RelayMessage::Error {
                message: "capabilities.hostname is required".to_string(),
            });
        }
        let registration = Registration {
            name,
            description,
            capabilities,
            tags,
        };
        let registered = match state.registry.register(registration).await {
            Ok(w) => w,
            Err(e) => {
                return Some(RelayMessage::Error {
                    message: format!("registration failed: {e}"),
                });
            }
        };
        // A socket carries one worker at a time.
        if let Some(previous) = *worker_id
            && previous != registered.id
        {
            info!(worker_id = %previous, replaced_by = %registered.id, "Socket re-registered as another worker");
            if let Err(e) = state.registry.set_offline(previous).await {
                warn!(worker_id = %previous, error = %e, "Failed to mark worker offline");
            }
        }
        if let Err(e) = state.registry.set_online(registered.id, handle.clone()).await {
            warn!(worker_id = %registered.id, error = %e, "Failed to mark worker online");
        }
        *worker_id = Some(registered.id);
        return Some(RelayMessage::Registered {
            worker_id: registered.id,
        });
    }

    let Some(id) = *worker_id else {
        return Some(RelayMessage::Error {
            message: "register first".to_string(),
        });
    };

    match message {
        WorkerMessage::Result { task_id, result } => {
            state.registry.touch(id).await;
            state.correlator.resolve(task_id, result).await;
            None
        }
        WorkerMessage::Error { task_id, error } => {
            state.registry.touch(id).await;
            state.correlator.reject(task_id, error).await;
            None
        }
        WorkerMessage::Status { status } => {
            if !status.is_available() {
                return Some(RelayMessage::Error {
                    message: format!("workers may only report online or busy, not {status}"),
                });
            }
            if let Err(e) = state.registry.set_status(id, status).await {
                warn!(worker_id = %id, error = %e, "Failed to update worker status");
            }
            None
        }
        WorkerMessage::Heartbeat => {
            state.registry.touch(id).await;
            None
        }
        WorkerMessage::Register { .. } => None,
    }
}
