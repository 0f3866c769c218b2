//! Chat message channel

use crate::error::{Error, Result};
use crate::listeners::ListenerId;
use crate::models::{local_message_id, ChatMessage, MessageType, CHAT_SEND_DESTINATION};
use crate::subscription::Inbox;
use crate::transport::BrokerClient;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ChatChannel {
    transport: BrokerClient,
    inbox: Arc<Inbox>,
    send_wait: Duration,
}

impl ChatChannel {
    pub(crate) fn new(transport: BrokerClient, inbox: Arc<Inbox>, send_wait: Duration) -> Self {
        Self {
            transport,
            inbox,
            send_wait,
        }
    }

    /// Publish a chat message. When the transport is down this triggers a
    /// connect and waits up to the configured bound for it to come up.
    /// Success means the frame was handed to the broker link, not persisted.
    pub async fn send_message(&self, message: &ChatMessage) -> Result<()> {
        if message.content.trim().is_empty() {
            return Err(Error::InvalidMessage("message content is empty".into()));
        }

        if !self.transport.is_connected() {
            if self.transport.identity().is_none() {
                return Err(Error::NotAuthenticated);
            }
            self.transport.connect();
            self.transport.wait_until_connected(self.send_wait).await?;
        }

        let body = serde_json::to_string(&OutboundMessage::from(message))?;
        self.transport.publish(CHAT_SEND_DESTINATION, body)
    }

    /// Called for every message on the joined conversation, in frame order.
    pub fn on_message_received(
        &self,
        callback: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inbox.messages.add(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inbox.messages.remove(id)
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    conversation_id: Value,
    sender_id: &'a str,
    content: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
}

impl<'a> From<&'a ChatMessage> for OutboundMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        // The server keys conversations numerically; opaque ids pass through.
        let conversation_id = match message.conversation_id.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(message.conversation_id.as_str()),
        };
        Self {
            conversation_id,
            sender_id: &message.sender_id,
            content: &message.content,
            message_type: "TEXT",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    sender_id: Option<Value>,
    #[serde(default)]
    conversation_id: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Parse a topic frame body into a [`ChatMessage`]. A missing id or
/// timestamp is filled in locally; a missing conversation id falls back to
/// the subscribed one.
pub fn normalize_inbound(body: &str, subscribed_conversation: &str) -> Result<ChatMessage> {
    let raw: InboundMessage = serde_json::from_str(body)?;

    let content = raw
        .content
        .ok_or_else(|| Error::InvalidMessage("missing content".into()))?;
    let sender_id = raw
        .sender_id
        .as_ref()
        .and_then(scalar_to_string)
        .ok_or_else(|| Error::InvalidMessage("missing senderId".into()))?;

    Ok(ChatMessage {
        id: raw
            .id
            .as_ref()
            .and_then(scalar_to_string)
            .unwrap_or_else(local_message_id),
        content,
        sender_id,
        conversation_id: raw
            .conversation_id
            .as_ref()
            .and_then(scalar_to_string)
            .unwrap_or_else(|| subscribed_conversation.to_string()),
        timestamp: raw
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        message_type: MessageType::Text,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch millis, RFC 3339, an offset-less local date-time (taken as UTC),
/// or a `[y, m, d, h, min, s, nanos]` array.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::String(s) => {
            if let Ok(millis) = s.parse::<i64>() {
                return Utc.timestamp_millis_opt(millis).single();
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Array(parts) => {
            let part = |i: usize| parts.get(i).and_then(Value::as_u64).unwrap_or(0) as u32;
            let year = parts.first()?.as_i64()? as i32;
            let naive = NaiveDate::from_ymd_opt(year, part(1), part(2))?
                .and_hms_nano_opt(part(3), part(4), part(5), part(6))?;
            Some(Utc.from_utc_datetime(&naive))
        }
        _ => None,
    }
}

// ============================================================================
// Message log
// ============================================================================

/// Visible message list of one conversation. History and live deliveries
/// are merged without ever appending the same message twice.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless a duplicate (same id, or same sender and content
    /// within one second) is already present.
    pub fn merge(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.is_duplicate_of(&message)) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn extend_history(&mut self, history: impl IntoIterator<Item = ChatMessage>) -> usize {
        history
            .into_iter()
            .filter(|m| self.merge(m.clone()))
            .count()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn sorted_by_time(&self) -> Vec<&ChatMessage> {
        let mut sorted: Vec<&ChatMessage> = self.messages.iter().collect();
        sorted.sort_by_key(|m| m.timestamp);
        sorted
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_outbound_body_uses_numeric_conversation_id() {
        let message = ChatMessage::compose("42", "u1", "hi");
        let body = serde_json::to_value(OutboundMessage::from(&message)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"conversationId": 42, "senderId": "u1", "content": "hi", "type": "TEXT"})
        );

        let opaque = ChatMessage::compose("conv-a", "u1", "hi");
        let body = serde_json::to_value(OutboundMessage::from(&opaque)).unwrap();
        assert_eq!(body["conversationId"], "conv-a");
    }

    #[test]
    fn test_normalize_fills_missing_id_and_timestamp() {
        let before = Utc::now();
        let message = normalize_inbound(r#"{"content":"hello","senderId":7}"#, "42").unwrap();

        assert!(message.id.starts_with("local-"));
        assert_eq!(message.sender_id, "7");
        assert_eq!(message.conversation_id, "42");
        assert!(message.timestamp >= before);
    }

    #[test]
    fn test_normalize_accepts_server_timestamp_shapes() {
        let millis = normalize_inbound(
            r#"{"id":10,"content":"a","senderId":"u1","conversationId":42,"timestamp":1700000000000}"#,
            "42",
        )
        .unwrap();
        assert_eq!(millis.id, "10");
        assert_eq!(millis.timestamp.timestamp_millis(), 1_700_000_000_000);

        let local = normalize_inbound(
            r#"{"content":"a","senderId":"u1","timestamp":"2024-05-01T10:30:00.250"}"#,
            "42",
        )
        .unwrap();
        assert_eq!(local.timestamp.to_rfc3339(), "2024-05-01T10:30:00.250+00:00");

        let array = normalize_inbound(
            r#"{"content":"a","senderId":"u1","timestamp":[2024,5,1,10,30,0]}"#,
            "42",
        )
        .unwrap();
        assert_eq!(array.timestamp.to_rfc3339(), "2024-05-01T10:30:00+00:00");
    }

    #[test]
    fn test_normalize_rejects_malformed_frames() {
        assert!(normalize_inbound("not json", "42").is_err());
        assert!(normalize_inbound(r#"{"senderId":"u1"}"#, "42").is_err());
        assert!(normalize_inbound(r#"{"content":"x"}"#, "42").is_err());
    }

    #[test]
    fn test_message_log_merges_history_and_live_without_duplicates() {
        let mut log = MessageLog::new();
        let first = ChatMessage::compose("42", "u1", "hello");
        let second = ChatMessage::compose("42", "u2", "hey");

        assert_eq!(log.extend_history(vec![first.clone(), second.clone()]), 2);

        // Server echo of our own message under its server id
        let mut echo = first.clone();
        echo.id = "srv-1".to_string();
        echo.timestamp = first.timestamp + ChronoDuration::milliseconds(300);
        assert!(!log.merge(echo));

        // Same id delivered twice
        assert!(!log.merge(second.clone()));

        // Same text later on is a new message
        let mut later = first.clone();
        later.id = "srv-2".to_string();
        later.timestamp = first.timestamp + ChronoDuration::seconds(5);
        assert!(log.merge(later));

        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_sorted_by_time() {
        let mut log = MessageLog::new();
        let mut late = ChatMessage::compose("1", "u1", "second");
        let early = ChatMessage::compose("1", "u2", "first");
        late.timestamp = early.timestamp + ChronoDuration::seconds(10);
        log.merge(late);
        log.merge(early);

        let contents: Vec<&str> = log.sorted_by_time().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
