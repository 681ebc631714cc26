//! Actor-per-connection transport glue.
//!
//! Splits the WebSocket into reader and writer halves:
//! - Writer task: owns the sink, forwards frames pushed to the mpsc channel
//! - Reader loop: maps inbound frames to router opcode classes
//!
//! The router and the watchdog reach this client only through the channel
//! sender held by its registry entry.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::payload::UserId;
use crate::chat::storage::Connection;
use crate::state::AppState;
use crate::ws::{self, InboundFrame};

/// Drive an authenticated connection until the peer goes away or the
/// server shuts down.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    remote_addr: SocketAddr,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let connection = Arc::new(Connection::new(
        ws::next_conn_id(),
        user_id,
        remote_addr,
        tx.clone(),
    ));

    // Writer task: owns the sink, drains the channel
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Registers the connection and drains the undelivered queue before any
    // new traffic is routed to this user.
    state.chat.handle_open(connection.clone());

    tracing::info!(
        user_id = user_id,
        conn_id = connection.conn_id(),
        remote = %remote_addr,
        "websocket connection opened"
    );

    let shutdown = state.chat.shutdown_token();

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(user_id = user_id, "server stopping, dropping connection");
                break;
            }
            received = ws_receiver.next() => received,
        };

        match received {
            Some(Ok(message)) => match message {
                Message::Text(text) => {
                    state
                        .chat
                        .handle_frame(&connection, InboundFrame::Text(text.to_string()));
                }
                Message::Binary(data) => {
                    state
                        .chat
                        .handle_frame(&connection, InboundFrame::Binary(data.to_vec()));
                }
                Message::Pong(_) => {
                    state.chat.handle_frame(&connection, InboundFrame::Pong);
                }
                Message::Ping(data) => {
                    // the transport answers pings itself; mirror it anyway
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::debug!(
                        user_id = user_id,
                        frame = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id = user_id, error = %e, "websocket receive error");
                break;
            }
            None => break,
        }
    }

    state.chat.handle_close(&connection);
    writer_handle.abort();

    tracing::info!(
        user_id = user_id,
        conn_id = connection.conn_id(),
        "websocket connection closed"
    );
}

/// Forward channel frames to the socket until it breaks or a close frame
/// goes out.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
}
