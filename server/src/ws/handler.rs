//! WebSocket upgrade endpoint.
//!
//! GET <endpoint>?id=<uint64>
//! Authenticates the upgrade request, requires a parseable user id, then
//! hands the socket to the connection actor. On rejection the connection
//! is upgraded and immediately closed with the specific code so clients
//! see a proper close frame instead of an HTTP error.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::chat::payload::BOT_USER_ID;
use crate::state::AppState;
use crate::ws::{actor, CLOSE_INVALID_QUERY_PARAMS, CLOSE_UNAUTHORIZED};

pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.auth.validate(&headers, &params).await {
        tracing::warn!(remote = %remote_addr, "websocket auth failed");
        return close_with(ws, CLOSE_UNAUTHORIZED, "Unauthorized".to_string());
    }

    let user_id = match params.get("id").map(String::as_str).filter(|id| !id.is_empty()) {
        None => {
            tracing::warn!(remote = %remote_addr, "connect rejected: no user id");
            return close_with(
                ws,
                CLOSE_INVALID_QUERY_PARAMS,
                "Id required in query parameter: ?id={id}".to_string(),
            );
        }
        Some(raw) => match raw.parse::<u64>() {
            Ok(id) if id != BOT_USER_ID => id,
            Ok(_) => {
                tracing::warn!(remote = %remote_addr, "connect rejected: reserved id 0");
                return close_with(
                    ws,
                    CLOSE_INVALID_QUERY_PARAMS,
                    "Id 0 is reserved".to_string(),
                );
            }
            Err(e) => {
                let reason = format!("Passed invalid id: id={}. {}", raw, e);
                tracing::warn!(remote = %remote_addr, reason = %reason, "connect rejected");
                return close_with(ws, CLOSE_INVALID_QUERY_PARAMS, reason);
            }
        },
    };

    tracing::debug!(user_id = user_id, remote = %remote_addr, "websocket connection authenticated");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id, remote_addr))
}

/// Upgrade the connection, then immediately close it with the error code.
fn close_with(ws: WebSocketUpgrade, code: u16, reason: String) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    })
}
