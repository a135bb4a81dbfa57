//! Structured app messages exchanged over the call's data channel.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender_id: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Arrival-ordered log of inbound messages, capped at `capacity` entries.
#[derive(Debug)]
pub struct MessageChannel {
    log: VecDeque<InboundMessage>,
    capacity: usize,
}

impl MessageChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Serialized form handed to the transport.
    pub fn encode(payload: &Value) -> String {
        payload.to_string()
    }

    /// Inbound payloads are JSON when they parse as JSON, plain text otherwise.
    pub fn decode(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    pub fn record(&mut self, sender_id: Option<String>, payload: Value) -> InboundMessage {
        let message = InboundMessage {
            sender_id: sender_id.unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            payload,
            received_at: Utc::now(),
        };
        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(message.clone());
        message
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.log.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_keeps_arrival_order_and_drops_oldest() {
        let mut channel = MessageChannel::new(2);
        channel.record(Some("a".into()), json!(1));
        channel.record(Some("b".into()), json!(2));
        channel.record(None, json!(3));

        let senders: Vec<_> = channel.messages().into_iter().map(|m| m.sender_id).collect();
        assert_eq!(senders, vec!["b", UNKNOWN_SENDER]);
    }

    #[test]
    fn double_encoded_payloads_decode_to_objects() {
        let sent = MessageChannel::encode(&json!({"type": "user-name", "name": "Ada"}));
        assert_eq!(MessageChannel::decode(&sent), json!({"type": "user-name", "name": "Ada"}));
        assert_eq!(MessageChannel::decode("hello there"), json!("hello there"));
    }

    #[test]
    fn clear_empties_the_log() {
        let mut channel = MessageChannel::new(4);
        channel.record(None, json!({}));
        channel.clear();
        assert!(channel.is_empty());
    }
}
