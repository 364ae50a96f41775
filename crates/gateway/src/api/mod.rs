//! HTTP surface: the streaming generate endpoint, run inspection, and
//! chat controls. Authentication sits in front of this service and is
//! not part of it.

pub mod chats;
pub mod generate;
pub mod runs;

use axum::http::{HeaderValue, Method};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = build_cors(&state.config.server.allowed_origins);

    Router::new()
        .route("/healthz", get(health))
        .route("/v1/generate/stream", post(generate::generate_stream))
        .route("/v1/runs", get(runs::list_runs))
        .route("/v1/runs/:id", get(runs::get_run))
        .route("/v1/runs/:id/events", get(runs::run_events))
        .route("/v1/chats/:chat_id/cancel", post(chats::cancel_chat))
        .route("/v1/chats/:chat_id/sandbox", get(chats::chat_sandbox))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
