//! Per-user traffic counters, updated from the routing path.
//!
//! Entries are created lazily on first reference and live for the process
//! lifetime. Counters are monotonically non-decreasing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::chat::payload::UserId;

pub struct UserStats {
    user_id: UserId,
    connections: AtomicU64,
    disconnections: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    bytes_transferred: AtomicU64,
    last_sent_at: AtomicI64,
    last_received_at: AtomicI64,
    last_activity_at: AtomicI64,
}

impl UserStats {
    fn new(user_id: UserId) -> Self {
        let now = Utc::now().timestamp();
        Self {
            user_id,
            connections: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            received_messages: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            last_sent_at: AtomicI64::new(now),
            last_received_at: AtomicI64::new(now),
            last_activity_at: AtomicI64::new(now),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.mark_activity();
    }

    pub fn add_disconnection(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_send_message(&self) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp();
        self.last_sent_at.store(now, Ordering::Release);
        self.last_activity_at.store(now, Ordering::Release);
    }

    pub fn add_received_message(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp();
        self.last_received_at.store(now, Ordering::Release);
        self.last_activity_at.store(now, Ordering::Release);
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn disconnections(&self) -> u64 {
        self.disconnections.load(Ordering::Relaxed)
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn last_sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.last_sent_at.load(Ordering::Acquire), 0)
    }

    pub fn last_received_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.last_received_at.load(Ordering::Acquire), 0)
    }

    /// Seconds since the user's most recent activity (connect, send or
    /// receive). Drives watchdog idle eviction.
    pub fn inactive_seconds(&self) -> i64 {
        (Utc::now().timestamp() - self.last_activity_at.load(Ordering::Acquire)).max(0)
    }

    fn mark_activity(&self) {
        self.last_activity_at
            .store(Utc::now().timestamp(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, seconds: i64) {
        self.last_activity_at
            .store(Utc::now().timestamp() - seconds, Ordering::Release);
    }
}

#[derive(Default)]
pub struct Statistics {
    users: DashMap<UserId, Arc<UserStats>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats entry for a user, created on first reference.
    pub fn user(&self, user_id: UserId) -> Arc<UserStats> {
        self.users
            .entry(user_id)
            .or_insert_with(|| Arc::new(UserStats::new(user_id)))
            .clone()
    }

    /// Read-only lookup that does not create an entry.
    pub fn get(&self, user_id: UserId) -> Option<Arc<UserStats>> {
        self.users.get(&user_id).map(|entry| entry.value().clone())
    }

    /// All known users, for the management surface.
    pub fn snapshot(&self) -> Vec<Arc<UserStats>> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }
}
