//! `POST /v1/generate/stream` — the streaming generation endpoint.
//!
//! Acquires a per-user slot, spawns the session orchestrator, and
//! relays its events as SSE frames (`data: <json>\n\n`). The wire ends
//! with the literal `data: [DONE]` marker followed by the terminal meta
//! frame. Dropping the response (client disconnect) cancels the chat
//! token and releases the slot.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use ed_domain::event::{MetaPhase, StreamEvent, DONE_MARKER};
use ed_providers::{LlmMessage, Role};

use crate::runtime::{run_session, SessionInput, SessionMode};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Authenticated caller (the auth middleware in front of this
    /// service resolves it).
    pub user_id: String,
    pub chat_id: String,
    /// Caller-scoped LLM credential, forwarded per request.
    pub api_key: String,
    /// The natural-language request.
    pub content: String,
    #[serde(default = "d_mode")]
    pub mode: SessionMode,
    #[serde(default)]
    pub user_message_id: Option<String>,
    #[serde(default)]
    pub assistant_message_id: Option<String>,
    #[serde(default)]
    pub is_new_chat: bool,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub project_context: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
}

fn d_mode() -> SessionMode {
    SessionMode::Generate
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn generate_stream(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> impl IntoResponse {
    if body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "validation", "reason": "content is empty" })),
        )
            .into_response();
    }

    // Per-user concurrency gate; 429 when the user is at the limit.
    if !state.gate.acquire(&body.user_id).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "rate_limited",
                "reason": format!(
                    "at most {} concurrent runs per user",
                    state.config.limits.max_concurrent_per_user
                ),
            })),
        )
            .into_response();
    }

    let input = SessionInput {
        user_id: body.user_id.clone(),
        chat_id: body.chat_id.clone(),
        api_key: body.api_key,
        user_content: body.content,
        mode: body.mode,
        user_message_id: body
            .user_message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        assistant_message_id: body
            .assistant_message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        is_new_chat: body.is_new_chat,
        history: body
            .history
            .into_iter()
            .map(|m| LlmMessage {
                role: m.role,
                content: m.content,
            })
            .collect(),
        project_context: body.project_context,
        workflow_id: body.workflow_id,
    };

    let (_run_id, rx) = run_session(state.clone(), input);
    let stream = sse_event_stream(state, body.user_id, body.chat_id, rx);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cleans up when the SSE response goes away, completed or not: an
/// abandoned stream cancels the chat's session; either way the user's
/// gate slot is released.
struct StreamGuard {
    state: AppState,
    user_id: String,
    chat_id: String,
    completed: Arc<AtomicBool>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let chat_id = std::mem::take(&mut self.chat_id);
        let completed = self.completed.load(Ordering::Acquire);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if !completed {
                    state.cancels.cancel(&chat_id);
                }
                state.gate.release(&user_id).await;
            });
        }
    }
}

fn sse_event_stream(
    state: AppState,
    user_id: String,
    chat_id: String,
    mut rx: tokio::sync::mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let completed = Arc::new(AtomicBool::new(false));
    let guard = StreamGuard {
        state,
        user_id,
        chat_id,
        completed: completed.clone(),
    };

    async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let terminal = matches!(
                &event,
                StreamEvent::Meta { phase: MetaPhase::SessionComplete, .. }
            );
            if terminal {
                completed.store(true, Ordering::Release);
                yield Ok(Event::default().data(DONE_MARKER));
            }
            yield Ok(Event::default().data(event.to_frame_json()));
            if terminal {
                break;
            }
        }
        // _guard drops here and releases the gate slot.
    }
}
