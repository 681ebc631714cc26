//! Per-recipient FIFO of payloads awaiting delivery.
//!
//! Populated when a recipient has no live connection, drained in insertion
//! order on that recipient's next connect. Feature-gated by
//! `chat.enableUndeliveredQueue`; disabled, enqueue is a no-op.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::chat::payload::{MessagePayload, UserId};

pub struct UndeliveredQueue {
    enabled: bool,
    queues: Mutex<HashMap<UserId, VecDeque<MessagePayload>>>,
}

impl UndeliveredQueue {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Queue a copy of `payload` addressed to exactly `recipient`.
    pub fn enqueue(&self, recipient: UserId, payload: &MessagePayload) {
        if !self.enabled {
            return;
        }
        let mut queues = self.queues.lock().expect("undelivered queue lock poisoned");
        queues
            .entry(recipient)
            .or_default()
            .push_back(payload.with_recipient(recipient));
    }

    /// Pop every queued payload for `recipient`, in insertion order.
    pub fn drain(&self, recipient: UserId) -> Vec<MessagePayload> {
        let mut queues = self.queues.lock().expect("undelivered queue lock poisoned");
        queues
            .remove(&recipient)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, recipient: UserId) -> bool {
        self.queues
            .lock()
            .expect("undelivered queue lock poisoned")
            .get(&recipient)
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }
}
