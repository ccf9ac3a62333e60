pub mod connections;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws::chat_ws))
        .route(
            "/api/connections/:provider/test",
            post(connections::test_connection),
        )
        .route(
            "/api/connections/:provider/models",
            post(connections::list_models),
        )
        .route("/api/health", get(connections::health))
        .with_state(state)
}
