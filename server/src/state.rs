use std::sync::Arc;

use crate::auth::Authenticator;
use crate::chat::ChatServer;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Router core: registry, queues, statistics, listeners.
    pub chat: Arc<ChatServer>,
    /// Validator consumed at connection open.
    pub auth: Arc<Authenticator>,
}
