//! Chat router core.
//!
//! `ChatServer` owns the connection registry, the reassembly buffer, the
//! undelivered queue and the per-user statistics, and runs the routing
//! pipeline: send-back, recipient fan-out, delivery-status echo and
//! offline retention. Transport glue lives in `crate::ws`; the router only
//! sees registered connections and inbound frame classes.

pub mod frame;
pub mod payload;
pub mod stats;
pub mod storage;
pub mod undelivered;
pub mod watchdog;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{human_bytes, Config, ConfigError};
use crate::ws::{InboundFrame, CLOSE_INVALID_MESSAGE_PAYLOAD, CLOSE_MESSAGE_TOO_BIG};

use frame::FrameBuffer;
use payload::{MessagePayload, UserId, BOT_USER_ID};
use stats::Statistics;
use storage::{Connection, ConnectionStorage};
use undelivered::UndeliveredQueue;

/// Invoked for every successfully routed payload; the event-notifier
/// sidecar hangs off this. Must not block.
pub type MessageListener = Arc<dyn Fn(&MessagePayload) + Send + Sync>;

/// Invoked once on graceful shutdown.
pub type StopListener = Box<dyn Fn() + Send + Sync>;

/// Routing settings derived from [`Config`] at construction. Immutable for
/// the server's lifetime.
pub struct ChatSettings {
    pub max_message_size: usize,
    pub enable_delivery_status: bool,
    pub enable_send_back: bool,
    pub ignore_types_send_back: Vec<String>,
    pub watchdog_enabled: bool,
    pub connection_lifetime_seconds: u64,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            max_message_size: config.max_message_size()?,
            enable_delivery_status: config.chat.message.enable_delivery_status,
            enable_send_back: config.chat.message.enable_send_back,
            ignore_types_send_back: config.chat.message.ignore_types_send_back.clone(),
            watchdog_enabled: config.server.watchdog.enabled,
            connection_lifetime_seconds: config.server.watchdog.connection_lifetime_seconds,
        })
    }
}

pub struct ChatServer {
    settings: ChatSettings,
    storage: ConnectionStorage,
    frames: FrameBuffer,
    undelivered: UndeliveredQueue,
    stats: Statistics,
    message_listeners: Mutex<Vec<MessageListener>>,
    stop_listeners: Mutex<Vec<StopListener>>,
    shutdown: CancellationToken,
}

impl ChatServer {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: ChatSettings::from_config(config)?,
            storage: ConnectionStorage::new(config.server.allow_override_connection),
            frames: FrameBuffer::new(),
            undelivered: UndeliveredQueue::new(config.chat.enable_undelivered_queue),
            stats: Statistics::new(),
            message_listeners: Mutex::new(Vec::new()),
            stop_listeners: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn storage(&self) -> &ConnectionStorage {
        &self.storage
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn undelivered(&self) -> &UndeliveredQueue {
        &self.undelivered
    }

    /// Token cancelled by [`stop`]; the transport and the watchdog shut
    /// down when it fires.
    ///
    /// [`stop`]: ChatServer::stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn add_message_listener<F>(&self, listener: F)
    where
        F: Fn(&MessagePayload) + Send + Sync + 'static,
    {
        self.message_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Arc::new(listener));
    }

    pub fn add_stop_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stop_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Graceful shutdown: cancels the shutdown token and fires the stop
    /// listeners exactly once.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let listeners = std::mem::take(
            &mut *self.stop_listeners.lock().expect("listener lock poisoned"),
        );
        for listener in &listeners {
            listener();
        }
        tracing::info!("chat server stopped");
    }

    /// Register an authenticated connection and redeliver anything queued
    /// for its user. The drain completes before this returns, so queued
    /// messages precede any newly routed traffic on the new socket.
    pub fn handle_open(&self, connection: Arc<Connection>) {
        let user_id = connection.user_id();
        tracing::debug!(
            user_id = user_id,
            conn_id = connection.conn_id(),
            remote = %connection.remote_addr(),
            "user connected"
        );
        self.storage.add(connection);
        self.stats.user(user_id).add_connection();
        self.redeliver_to(user_id);
    }

    /// Transport-close notification. Idempotent against watchdog eviction.
    pub fn handle_close(&self, connection: &Connection) {
        if self.storage.remove_connection(connection) {
            self.stats.user(connection.user_id()).add_disconnection();
            tracing::debug!(
                user_id = connection.user_id(),
                conn_id = connection.conn_id(),
                "user disconnected"
            );
        }
    }

    /// Inbound frame dispatch, per opcode class.
    pub fn handle_frame(&self, connection: &Arc<Connection>, frame: InboundFrame) {
        connection.touch();
        let sender = connection.user_id();
        match frame {
            InboundFrame::Pong => self.storage.mark_pong_received(connection),
            InboundFrame::FragmentBegin { data, .. } => self.frames.write(sender, &data, true),
            InboundFrame::FragmentContinue(data) => self.frames.write(sender, &data, false),
            InboundFrame::FragmentEnd(data) => {
                let mut assembled = self.frames.read(sender, true);
                assembled.extend_from_slice(&data);
                self.handle_complete(connection, &assembled, false);
            }
            InboundFrame::Text(text) => self.handle_complete(connection, text.as_bytes(), false),
            InboundFrame::Binary(data) => self.handle_complete(connection, &data, true),
        }
    }

    /// A complete (possibly reassembled) wire message from a client.
    fn handle_complete(&self, connection: &Arc<Connection>, bytes: &[u8], binary: bool) {
        if bytes.len() > self.settings.max_message_size {
            connection.send_close(
                CLOSE_MESSAGE_TOO_BIG,
                format!(
                    "Message too big. Maximum size: {}",
                    human_bytes(self.settings.max_message_size)
                ),
            );
            return;
        }

        let mut payload = match MessagePayload::from_wire(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                connection.send_close(
                    CLOSE_INVALID_MESSAGE_PAYLOAD,
                    format!("Invalid payload. {}", e),
                );
                return;
            }
        };
        payload.set_binary(binary);

        if self.settings.enable_send_back
            && !self.is_ignored_send_back_type(payload.kind())
            && !payload.is_for_bot()
        {
            self.send_to(payload.sender(), &payload);
        }

        self.send(&payload);
    }

    /// Route a payload: listeners first, then socket fan-out unless the
    /// payload is bot-only.
    pub fn send(&self, payload: &MessagePayload) {
        self.notify_listeners(payload);

        if payload.is_for_bot() {
            tracing::debug!(sender = payload.sender(), "message routed to bot listeners only");
            return;
        }

        for &recipient in payload.recipients() {
            if recipient == BOT_USER_ID {
                continue;
            }
            self.send_to(recipient, payload);
        }
    }

    /// Deliver to every live connection of one recipient. An absent
    /// recipient is not an error: the payload is retained (when enabled)
    /// and the attempt is accounted.
    pub fn send_to(&self, recipient: UserId, payload: &MessagePayload) {
        let wire = payload.to_wire();
        let size = wire.len();

        let connections = match self.storage.get(recipient) {
            Ok(connections) => connections,
            Err(_) => {
                self.handle_undeliverable(recipient, payload);
                self.on_message_sent(payload.with_recipient(recipient), size, false);
                return;
            }
        };

        for connection in connections {
            // serialization buffer is per send; never reused across connections
            match connection.send_payload(&wire, payload.is_binary()) {
                Ok(bytes) => {
                    self.on_message_sent(payload.with_recipient(recipient), bytes, true);
                }
                Err(broken) => {
                    tracing::debug!(
                        user_id = broken.user_id,
                        conn_id = broken.conn_id,
                        "broken pipe, evicting connection"
                    );
                    self.storage.remove(broken.user_id, broken.conn_id);
                    self.handle_undeliverable(recipient, payload);
                }
            }
        }
    }

    /// Retain a payload for an unreachable recipient, or drop it when the
    /// queue feature is off.
    fn handle_undeliverable(&self, recipient: UserId, payload: &MessagePayload) {
        if !self.undelivered.enabled() {
            tracing::debug!(user_id = recipient, "user unavailable, dropping message");
            return;
        }
        self.undelivered.enqueue(recipient, payload);
        tracing::debug!(user_id = recipient, "user unavailable, message queued");
    }

    /// Delivery accounting and optional delivery-status echo. `payload` is
    /// the single-recipient copy for this attempt.
    fn on_message_sent(&self, payload: MessagePayload, bytes: usize, has_sent: bool) {
        if payload.is_sent_status() {
            return;
        }

        let sender = self.stats.user(payload.sender());
        sender.add_send_message();
        sender.add_bytes_transferred(bytes as u64);

        for &recipient in payload.recipients() {
            if has_sent {
                let stat = self.stats.user(recipient);
                stat.add_received_message();
                stat.add_bytes_transferred(bytes as u64);
            }
        }

        if self.settings.enable_delivery_status && has_sent {
            let status = MessagePayload::sent_status(&payload);
            self.send(&status);
        }
    }

    /// Drain the undelivered queue for a reconnecting user through the
    /// normal send path. Returns the redelivered count.
    pub fn redeliver_to(&self, recipient: UserId) -> usize {
        if !self.undelivered.enabled() {
            return 0;
        }
        let queued = self.undelivered.drain(recipient);
        if queued.is_empty() {
            return 0;
        }
        tracing::debug!(
            user_id = recipient,
            count = queued.len(),
            "redelivering queued messages"
        );
        for payload in &queued {
            self.send(payload);
        }
        queued.len()
    }

    fn is_ignored_send_back_type(&self, kind: &str) -> bool {
        self.settings
            .ignore_types_send_back
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(kind))
    }

    /// Listener callbacks run under a guard: a panicking listener is
    /// logged and must not affect routing.
    fn notify_listeners(&self, payload: &MessagePayload) {
        let listeners: Vec<MessageListener> = self
            .message_listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                tracing::error!(kind = payload.kind(), "message listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use crate::ws::{self, CLOSE_INVALID_MESSAGE_PAYLOAD, CLOSE_MESSAGE_TOO_BIG};

    fn test_server(tweak: impl FnOnce(&mut Config)) -> ChatServer {
        let mut config = Config::default();
        tweak(&mut config);
        ChatServer::new(&config).unwrap()
    }

    fn open(server: &ChatServer, user_id: UserId) -> (Arc<Connection>, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(
            ws::next_conn_id(),
            user_id,
            "127.0.0.1:9".parse().unwrap(),
            tx,
        ));
        server.handle_open(connection.clone());
        (connection, rx)
    }

    fn recv_payloads(rx: &mut UnboundedReceiver<Message>) -> Vec<MessagePayload> {
        let mut payloads = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                payloads.push(MessagePayload::from_wire(text.as_bytes()).unwrap());
            }
        }
        payloads
    }

    fn recv_close(rx: &mut UnboundedReceiver<Message>) -> Option<(u16, String)> {
        while let Ok(message) = rx.try_recv() {
            if let Message::Close(Some(frame)) = message {
                return Some((frame.code, frame.reason.to_string()));
            }
        }
        None
    }

    fn wire(kind: &str, sender: UserId, recipients: &[UserId], body: &str) -> String {
        json!({ "type": kind, "sender": sender, "recipients": recipients, "body": body })
            .to_string()
    }

    #[test]
    fn routes_one_to_one_and_accounts() {
        let server = test_server(|_| {});
        let (sender, mut sender_rx) = open(&server, 10);
        let (_recipient, mut recipient_rx) = open(&server, 20);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "hi")));

        let received = recv_payloads(&mut recipient_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), "msg");
        assert_eq!(received[0].body(), Some(&json!("hi")));

        // send-back disabled by default
        assert!(recv_payloads(&mut sender_rx).is_empty());

        assert_eq!(server.stats().user(10).sent_messages(), 1);
        assert_eq!(server.stats().user(20).received_messages(), 1);
        assert!(server.stats().user(10).bytes_transferred() > 0);
    }

    #[test]
    fn fan_out_reaches_all_connections_of_all_recipients() {
        let server = test_server(|_| {});
        let (sender, _srx) = open(&server, 10);
        let (_a1, mut rx_a1) = open(&server, 20);
        let (_a2, mut rx_a2) = open(&server, 20);
        let (_b, mut rx_b) = open(&server, 30);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20, 30], "x")));

        assert_eq!(recv_payloads(&mut rx_a1).len(), 1);
        assert_eq!(recv_payloads(&mut rx_a2).len(), 1);
        assert_eq!(recv_payloads(&mut rx_b).len(), 1);
        // one send per recipient, not per connection pair
        assert_eq!(server.stats().user(20).received_messages(), 2);
        assert_eq!(server.stats().user(30).received_messages(), 1);
    }

    #[test]
    fn fragmented_message_assembles_to_one_delivery() {
        let server = test_server(|_| {});
        let (sender, _srx) = open(&server, 10);
        let (_recipient, mut rx) = open(&server, 20);

        let full = wire("msg", 10, &[20], "ABC");
        let third = full.len() / 3;
        let (a, rest) = full.as_bytes().split_at(third);
        let (b, c) = rest.split_at(third);

        server.handle_frame(
            &sender,
            InboundFrame::FragmentBegin { binary: false, data: a.to_vec() },
        );
        assert!(recv_payloads(&mut rx).is_empty());
        server.handle_frame(&sender, InboundFrame::FragmentContinue(b.to_vec()));
        server.handle_frame(&sender, InboundFrame::FragmentEnd(c.to_vec()));

        let received = recv_payloads(&mut rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body(), Some(&json!("ABC")));
        assert!(!server.frames.has(10));
    }

    #[test]
    fn oversize_message_closes_sender_and_routes_nothing() {
        let server = test_server(|c| c.chat.message.max_size = "1K".to_string());
        let (sender, mut sender_rx) = open(&server, 10);
        let (_recipient, mut recipient_rx) = open(&server, 20);

        let body = "x".repeat(2048);
        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], &body)));

        let (code, reason) = recv_close(&mut sender_rx).expect("close frame");
        assert_eq!(code, CLOSE_MESSAGE_TOO_BIG);
        assert!(reason.contains("1K"), "reason was {:?}", reason);
        assert!(recv_payloads(&mut recipient_rx).is_empty());
    }

    #[test]
    fn invalid_payload_closes_with_parse_error() {
        let server = test_server(|_| {});
        let (sender, mut sender_rx) = open(&server, 10);

        server.handle_frame(&sender, InboundFrame::Text("{broken".to_string()));

        let (code, reason) = recv_close(&mut sender_rx).expect("close frame");
        assert_eq!(code, CLOSE_INVALID_MESSAGE_PAYLOAD);
        assert!(reason.starts_with("Invalid payload."));
    }

    #[test]
    fn send_back_echoes_except_ignored_types() {
        let server = test_server(|c| {
            c.chat.message.enable_send_back = true;
            c.chat.message.ignore_types_send_back = vec!["typing".to_string()];
        });
        let (sender, mut sender_rx) = open(&server, 10);
        let (_recipient, mut recipient_rx) = open(&server, 20);

        server.handle_frame(&sender, InboundFrame::Text(wire("Typing", 10, &[20], "")));
        assert!(recv_payloads(&mut sender_rx).is_empty(), "ignored type must not echo");
        assert_eq!(recv_payloads(&mut recipient_rx).len(), 1);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "hi")));
        let echoed = recv_payloads(&mut sender_rx);
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].kind(), "msg");
    }

    #[test]
    fn bot_messages_reach_listeners_but_no_sockets() {
        let server = test_server(|_| {});
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_listener = seen.clone();
        server.add_message_listener(move |_| {
            seen_by_listener.fetch_add(1, Ordering::SeqCst);
        });

        let (sender, _srx) = open(&server, 10);
        let (_recipient, mut recipient_rx) = open(&server, 20);

        // recipient 0 marks the whole payload bot-only, even with 20 listed
        server.handle_frame(&sender, InboundFrame::Text(wire("cmd", 10, &[0, 20], "")));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(recv_payloads(&mut recipient_rx).is_empty());
    }

    #[test]
    fn offline_recipient_messages_queue_and_redeliver_in_order() {
        let server = test_server(|_| {});
        let (sender, _srx) = open(&server, 10);

        for body in ["m1", "m2", "m3"] {
            server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], body)));
        }
        assert!(server.undelivered().has(20));

        let (_recipient, mut rx) = open(&server, 20);
        // drain happened synchronously inside handle_open
        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "m4")));

        let received = recv_payloads(&mut rx);
        let bodies: Vec<_> = received.iter().map(|p| p.body().cloned().unwrap()).collect();
        assert_eq!(bodies, vec![json!("m1"), json!("m2"), json!("m3"), json!("m4")]);
        assert!(!server.undelivered().has(20));
    }

    #[test]
    fn disabled_queue_drops_offline_messages() {
        let server = test_server(|c| c.chat.enable_undelivered_queue = false);
        let (sender, _srx) = open(&server, 10);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "gone")));
        assert!(!server.undelivered().has(20));

        let (_recipient, mut rx) = open(&server, 20);
        assert!(recv_payloads(&mut rx).is_empty());
    }

    #[test]
    fn delivery_status_echoes_once_per_delivery() {
        let server = test_server(|c| c.chat.message.enable_delivery_status = true);
        let (sender, mut sender_rx) = open(&server, 10);
        let (_recipient, mut recipient_rx) = open(&server, 20);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "hi")));

        let to_recipient = recv_payloads(&mut recipient_rx);
        assert_eq!(to_recipient.len(), 1);
        assert_eq!(to_recipient[0].kind(), "msg");

        let to_sender = recv_payloads(&mut sender_rx);
        assert_eq!(to_sender.len(), 1);
        assert!(to_sender[0].is_sent_status());
        assert_eq!(to_sender[0].sender(), 20);
        assert_eq!(to_sender[0].recipients(), &[10]);
    }

    #[test]
    fn broken_connection_is_evicted_and_message_retained() {
        let server = test_server(|_| {});
        let (sender, _srx) = open(&server, 10);
        let (_recipient, rx) = open(&server, 20);
        drop(rx); // peer is gone, channel closed

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "hi")));

        assert!(!server.storage().exists(20));
        assert!(server.undelivered().has(20));
    }

    #[test]
    fn panicking_listener_does_not_break_routing() {
        let server = test_server(|_| {});
        server.add_message_listener(|_| panic!("listener bug"));

        let (sender, _srx) = open(&server, 10);
        let (_recipient, mut rx) = open(&server, 20);

        server.handle_frame(&sender, InboundFrame::Text(wire("msg", 10, &[20], "hi")));
        assert_eq!(recv_payloads(&mut rx).len(), 1);
    }

    #[test]
    fn pong_resets_liveness() {
        let server = test_server(|_| {});
        let (connection, _rx) = open(&server, 10);

        server.storage().mark_pong_wait(&connection);
        server.handle_frame(&connection, InboundFrame::Pong);
        assert_eq!(server.storage().disconnect_without_pong(), 0);
    }

    #[test]
    fn stop_fires_listeners_once() {
        let server = test_server(|_| {});
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_by_listener = fired.clone();
        server.add_stop_listener(move || {
            fired_by_listener.fetch_add(1, Ordering::SeqCst);
        });

        server.stop();
        server.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(server.shutdown_token().is_cancelled());
    }
}
