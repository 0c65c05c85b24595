//! Route definitions for the relay server.

use axum::{
    routing::{get, post},
    Router,
};

use super::api;
use super::server::AppState;
use super::ws::ws_handler;

/// Task routes, nested under `/tasks`.
pub fn create_task_router() -> Router<AppState> {
    Router::new()
        .route("/", get(api::list_tasks).post(api::send_task))
        .route("/:id", get(api::get_task))
        .route("/:id/claim", post(api::claim_task))
        .route("/:id/ack", post(api::ack_task))
        .route("/:id/rollup", get(api::get_rollup))
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::index))
        .route("/health", get(api::health))

        // Relay
        .route("/ws", get(ws_handler))
        .route("/agents", get(api::list_agents))
        .route("/stats", get(api::stats))
        .route("/inbox/:agent_id", get(api::inbox))
        .route("/inbox/:agent_id/ack", post(api::ack_inbox))
        .route("/send", post(api::send_message))

        // Tasks
        .nest("/tasks", create_task_router())
        .with_state(state)
}
