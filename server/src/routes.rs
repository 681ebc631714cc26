use axum::{routing::get, Router};

use crate::state::AppState;
use crate::ws::handler;

/// Wire the configured WebSocket endpoint to the upgrade handler.
pub fn build_router(state: AppState, endpoint: &str) -> Router {
    Router::new()
        .route(endpoint, get(handler::ws_upgrade))
        .with_state(state)
}
