//! REST endpoints for chatting with the relay.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent_loop::Agent;

/// Shared state for chat routes.
#[derive(Clone)]
pub struct ChatRouteState {
    pub agent: Arc<Agent>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Omit to start a new conversation.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
}

/// POST /api/chat
///
/// Runs one turn of the conversation loop and returns the reply.
async fn chat(
    State(state): State<ChatRouteState>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    if request.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "message must not be empty"})),
        )
            .into_response();
    }

    let conversation_id = request
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let response = state
        .agent
        .handle_turn(&conversation_id, &request.message)
        .await;

    Json(ChatResponse {
        conversation_id,
        response,
    })
    .into_response()
}

/// POST /api/chat/{id}/clear
async fn clear(
    State(state): State<ChatRouteState>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    if state.agent.clear(&conversation_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown conversation"})),
        )
            .into_response()
    }
}

/// GET /api/chat/{id}/history
async fn history(
    State(state): State<ChatRouteState>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    match state.agent.history(&conversation_id).await {
        Some(messages) => Json(messages).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown conversation"})),
        )
            .into_response(),
    }
}

/// Build the chat REST routes.
pub fn chat_routes(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/{id}/clear", post(clear))
        .route("/api/chat/{id}/history", get(history))
        .with_state(ChatRouteState { agent })
}
