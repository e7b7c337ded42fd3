//! WebSocket gateway
//!
//! Three upgrade routes share one coordinator state: visitors wait on
//! `/api/start_queue`, chat (both visitor and agent sides) runs over
//! `/api/start_chat`, and agent-to-agent messaging over
//! `/api/start_messaging`.

pub mod chat;
pub mod connection;
pub mod events;
pub mod messaging;
pub mod queue;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start_queue", get(queue::ws_handler))
        .route("/api/start_chat", get(chat::ws_handler))
        .route("/api/start_messaging", get(messaging::ws_handler))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
