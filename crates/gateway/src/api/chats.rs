//! Chat-scoped control endpoints.
//!
//! - `POST /v1/chats/:chat_id/cancel`  — stop the running session
//! - `GET  /v1/chats/:chat_id/sandbox` — the chat's active sandbox

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

pub async fn cancel_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.cancels.cancel(&chat_id);
    if cancelled {
        tracing::info!(chat_id = %chat_id, "session cancel requested");
    }
    Json(serde_json::json!({ "cancelled": cancelled }))
}

pub async fn chat_sandbox(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    let instance = state
        .sandboxes
        .get_active(&chat_id)
        .and_then(|id| state.sandboxes.instance(&id));
    match instance {
        Some(instance) => Json(instance).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no active sandbox" })),
        )
            .into_response(),
    }
}
