//! Wire message value.
//!
//! Messages are JSON objects with required `type`, `sender` and
//! `recipients` fields. Unknown fields are preserved so clients can carry
//! application data without the router caring about it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

pub type UserId = u64;

/// Reserved recipient id routed to listeners only, never to sockets.
pub const BOT_USER_ID: UserId = 0;

/// Type tag of delivery-status acknowledgments.
pub const TYPE_MESSAGE_SENT: &str = "message_sent";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("message is not a valid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message type must not be empty")]
    EmptyType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    kind: String,
    sender: UserId,
    recipients: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    /// Client-defined fields, carried through verbatim.
    #[serde(flatten)]
    extra: Map<String, Value>,
    #[serde(skip)]
    binary: bool,
}

impl MessagePayload {
    pub fn new(kind: impl Into<String>, sender: UserId, recipients: Vec<UserId>) -> Self {
        let mut payload = Self {
            kind: kind.into(),
            sender,
            recipients,
            body: None,
            extra: Map::new(),
            binary: false,
        };
        payload.dedup_recipients();
        payload
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Decode a complete wire frame. Any failure carries a human-readable
    /// reason suitable for the close frame.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(bytes)?;
        let mut payload: MessagePayload = serde_json::from_str(text)?;
        if payload.kind.trim().is_empty() {
            return Err(PayloadError::EmptyType);
        }
        payload.dedup_recipients();
        Ok(payload)
    }

    /// Canonical serialization; re-parsing yields an equal payload.
    pub fn to_wire(&self) -> String {
        // a JSON object with string keys cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    pub fn recipients(&self) -> &[UserId] {
        &self.recipients
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn set_binary(&mut self, binary: bool) {
        self.binary = binary;
    }

    /// Bot-only payloads trigger listener callbacks, never socket fan-out.
    pub fn is_for_bot(&self) -> bool {
        self.recipients.contains(&BOT_USER_ID)
    }

    /// Delivery-status payloads must never trigger another status echo.
    pub fn is_sent_status(&self) -> bool {
        self.kind == TYPE_MESSAGE_SENT
    }

    /// Single-recipient copy used for queueing and delivery accounting.
    pub fn with_recipient(&self, recipient: UserId) -> Self {
        let mut copy = self.clone();
        copy.recipients = vec![recipient];
        copy
    }

    /// Acknowledgment of `delivered` back to its sender. `delivered` is the
    /// single-recipient copy produced by [`with_recipient`].
    ///
    /// [`with_recipient`]: MessagePayload::with_recipient
    pub fn sent_status(delivered: &MessagePayload) -> Self {
        let from = delivered
            .recipients
            .first()
            .copied()
            .unwrap_or(BOT_USER_ID);
        MessagePayload::new(TYPE_MESSAGE_SENT, from, vec![delivered.sender])
    }

    fn dedup_recipients(&mut self) {
        let mut seen = HashSet::with_capacity(self.recipients.len());
        self.recipients.retain(|id| seen.insert(*id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_message() {
        let payload =
            MessagePayload::from_wire(br#"{"type":"msg","sender":10,"recipients":[20],"body":"hi"}"#)
                .unwrap();
        assert_eq!(payload.kind(), "msg");
        assert_eq!(payload.sender(), 10);
        assert_eq!(payload.recipients(), &[20]);
        assert_eq!(payload.body(), Some(&json!("hi")));
        assert!(!payload.is_for_bot());
    }

    #[test]
    fn round_trip_preserves_routing_fields() {
        let payload = MessagePayload::from_wire(
            br#"{"type":"msg","sender":10,"recipients":[20,30],"body":{"k":1},"custom":"x"}"#,
        )
        .unwrap();
        let reparsed = MessagePayload::from_wire(payload.to_wire().as_bytes()).unwrap();
        assert_eq!(reparsed.kind(), payload.kind());
        assert_eq!(reparsed.sender(), payload.sender());
        assert_eq!(reparsed.recipients(), payload.recipients());
        assert_eq!(reparsed, payload);
    }

    #[test]
    fn missing_required_fields_fail_with_reason() {
        let err = MessagePayload::from_wire(br#"{"type":"msg","sender":10}"#).unwrap_err();
        assert!(err.to_string().contains("recipients"));

        let err = MessagePayload::from_wire(br#"{"sender":10,"recipients":[1]}"#).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn rejects_non_json_and_non_utf8() {
        assert!(MessagePayload::from_wire(b"not json at all").is_err());
        assert!(MessagePayload::from_wire(&[0xff, 0xfe, 0x01]).is_err());
        assert!(matches!(
            MessagePayload::from_wire(br#"{"type":"  ","sender":1,"recipients":[2]}"#),
            Err(PayloadError::EmptyType)
        ));
    }

    #[test]
    fn recipient_zero_means_bot() {
        let payload =
            MessagePayload::from_wire(br#"{"type":"cmd","sender":10,"recipients":[0]}"#).unwrap();
        assert!(payload.is_for_bot());
    }

    #[test]
    fn duplicate_recipients_collapse() {
        let payload =
            MessagePayload::from_wire(br#"{"type":"msg","sender":1,"recipients":[2,3,2,2,3]}"#)
                .unwrap();
        assert_eq!(payload.recipients(), &[2, 3]);
    }

    #[test]
    fn with_recipient_narrows_to_one() {
        let payload = MessagePayload::new("msg", 10, vec![20, 30]);
        let copy = payload.with_recipient(20);
        assert_eq!(copy.recipients(), &[20]);
        assert_eq!(copy.sender(), 10);
        // the source is untouched
        assert_eq!(payload.recipients(), &[20, 30]);
    }

    #[test]
    fn sent_status_acknowledges_to_sender() {
        let delivered = MessagePayload::new("msg", 10, vec![20]);
        let status = MessagePayload::sent_status(&delivered);
        assert!(status.is_sent_status());
        assert_eq!(status.sender(), 20);
        assert_eq!(status.recipients(), &[10]);
    }

    #[test]
    fn binary_flag_survives_copies_but_not_the_wire() {
        let mut payload = MessagePayload::new("msg", 10, vec![20]);
        payload.set_binary(true);
        assert!(payload.with_recipient(20).is_binary());

        let reparsed = MessagePayload::from_wire(payload.to_wire().as_bytes()).unwrap();
        assert!(!reparsed.is_binary());
    }
}
