//! Run inspection endpoints.
//!
//! - `GET /v1/runs`             — list recent runs (filter by chat)
//! - `GET /v1/runs/:id`         — one run record
//! - `GET /v1/runs/:id/events`  — the seq-ordered event log, resumable
//!   from a checkpoint via `after_seq`

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn d_limit() -> usize {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let (runs, total) = state
        .runs
        .list(query.chat_id.as_deref(), query.limit.min(200), query.offset);
    Json(serde_json::json!({ "runs": runs, "total": total }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.runs.get(&id) {
        Some(run) => Json(run).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "run not found" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after_seq: u64,
}

pub async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    if state.runs.get(&id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "run not found" })),
        )
            .into_response();
    }
    let events = state.runs.events(&id, query.after_seq);
    Json(serde_json::json!({ "events": events })).into_response()
}
