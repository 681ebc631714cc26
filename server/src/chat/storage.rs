//! Connection registry: live connections per user, with liveness state.
//!
//! A user may hold several concurrent connections (devices, tabs). The
//! registry holds non-owning handles keyed by connection id; the transport
//! actor owns the socket and removes its entry on close.

use axum::extract::ws::{CloseFrame, Message};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::chat::payload::UserId;
use crate::ws::{ConnectionSender, CLOSE_INACTIVE_CONNECTION, CLOSE_POLICY_VIOLATION};

pub type ConnId = u64;

#[derive(Debug, Error)]
#[error("no live connections for user {0}")]
pub struct ConnectionNotFound(pub UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    AwaitingPong,
}

/// The writer channel is closed, meaning the peer socket is gone.
#[derive(Debug, Error)]
#[error("connection {conn_id} of user {user_id} is gone")]
pub struct BrokenPipe {
    pub user_id: UserId,
    pub conn_id: ConnId,
}

/// A live client connection as seen by the router.
pub struct Connection {
    conn_id: ConnId,
    user_id: UserId,
    remote_addr: SocketAddr,
    opened_at: DateTime<Utc>,
    last_activity: AtomicI64,
    awaiting_pong: AtomicBool,
    sender: ConnectionSender,
}

impl Connection {
    pub fn new(
        conn_id: ConnId,
        user_id: UserId,
        remote_addr: SocketAddr,
        sender: ConnectionSender,
    ) -> Self {
        let now = Utc::now();
        Self {
            conn_id,
            user_id,
            remote_addr,
            opened_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            awaiting_pong: AtomicBool::new(false),
            sender,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn liveness(&self) -> Liveness {
        if self.awaiting_pong.load(Ordering::Acquire) {
            Liveness::AwaitingPong
        } else {
            Liveness::Active
        }
    }

    pub fn last_activity_ts(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// Record activity on this connection.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Release);
    }

    /// Enqueue a serialized payload; returns the wire byte count. A closed
    /// channel means the writer task died with the socket.
    pub fn send_payload(&self, wire: &str, binary: bool) -> Result<usize, BrokenPipe> {
        let message = if binary {
            Message::Binary(Bytes::copy_from_slice(wire.as_bytes()))
        } else {
            Message::Text(wire.to_string().into())
        };
        self.sender
            .send(message)
            .map(|_| wire.len())
            .map_err(|_| BrokenPipe {
                user_id: self.user_id,
                conn_id: self.conn_id,
            })
    }

    /// One-byte liveness probe.
    pub fn send_ping(&self) -> Result<(), BrokenPipe> {
        self.sender
            .send(Message::Ping(Bytes::from_static(b".")))
            .map_err(|_| BrokenPipe {
                user_id: self.user_id,
                conn_id: self.conn_id,
            })
    }

    /// Ask the writer task to close the socket with a code and reason.
    /// Failures are ignored: a closed channel is already the end state.
    pub fn send_close(&self, code: u16, reason: impl Into<String>) {
        let frame = CloseFrame {
            code,
            reason: reason.into().into(),
        };
        let _ = self.sender.send(Message::Close(Some(frame)));
    }

    fn set_awaiting_pong(&self, awaiting: bool) {
        self.awaiting_pong.store(awaiting, Ordering::Release);
    }
}

pub struct ConnectionStorage {
    connections: DashMap<UserId, HashMap<ConnId, Arc<Connection>>>,
    allow_override: bool,
}

impl ConnectionStorage {
    pub fn new(allow_override: bool) -> Self {
        Self {
            connections: DashMap::new(),
            allow_override,
        }
    }

    /// Register a connection. With override enabled, prior connections of
    /// the same user are closed with `POLICY_VIOLATION` first.
    pub fn add(&self, connection: Arc<Connection>) {
        let user_id = connection.user_id();
        let mut entry = self.connections.entry(user_id).or_default();

        if self.allow_override && !entry.is_empty() {
            for (_, old) in entry.drain() {
                tracing::debug!(
                    user_id = user_id,
                    conn_id = old.conn_id(),
                    "overriding existing connection"
                );
                old.send_close(CLOSE_POLICY_VIOLATION, "Connection overridden");
            }
        }

        entry.insert(connection.conn_id(), connection);
    }

    /// Remove a connection by id pair. Safe to call repeatedly; only the
    /// first call changes state.
    pub fn remove(&self, user_id: UserId, conn_id: ConnId) -> bool {
        let removed = match self.connections.get_mut(&user_id) {
            Some(mut entry) => entry.remove(&conn_id).is_some(),
            None => false,
        };
        self.connections.remove_if(&user_id, |_, conns| conns.is_empty());
        removed
    }

    pub fn remove_connection(&self, connection: &Connection) -> bool {
        self.remove(connection.user_id(), connection.conn_id())
    }

    pub fn exists(&self, user_id: UserId) -> bool {
        self.connections
            .get(&user_id)
            .map(|entry| !entry.is_empty())
            .unwrap_or(false)
    }

    pub fn size(&self, user_id: UserId) -> usize {
        self.connections
            .get(&user_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// All live connections of a user.
    pub fn get(&self, user_id: UserId) -> Result<Vec<Arc<Connection>>, ConnectionNotFound> {
        match self.connections.get(&user_id) {
            Some(entry) if !entry.is_empty() => Ok(entry.values().cloned().collect()),
            _ => Err(ConnectionNotFound(user_id)),
        }
    }

    pub fn mark_pong_wait(&self, connection: &Connection) {
        connection.set_awaiting_pong(true);
    }

    pub fn mark_pong_received(&self, connection: &Connection) {
        connection.set_awaiting_pong(false);
        connection.touch();
    }

    /// Close and remove every connection still awaiting a pong. Returns the
    /// number of removed connections.
    pub fn disconnect_without_pong(&self) -> usize {
        let mut removed = 0;
        for connection in self.snapshot() {
            if connection.liveness() == Liveness::AwaitingPong {
                connection.send_close(CLOSE_INACTIVE_CONNECTION, "No pong received");
                if self.remove_connection(&connection) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Copy of all live connections, for iteration without holding locks.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .flat_map(|entry| entry.values().cloned().collect::<Vec<_>>())
            .collect()
    }
}
