//! Data models for the Homestay real-time core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Destinations
// ============================================================================

/// Application destination chat messages are published to.
pub const CHAT_SEND_DESTINATION: &str = "/app/chat.sendMessage";

/// Application destination call signals are published to.
pub const CALL_SEND_DESTINATION: &str = "/app/call.signal";

/// Topic carrying chat messages of one conversation.
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("/topic/conversation.{}", conversation_id)
}

/// Topic carrying call signals of one conversation.
pub fn call_topic(conversation_id: &str) -> String {
    format!("/topic/call.{}", conversation_id)
}

// ============================================================================
// Identity
// ============================================================================

/// Already-resolved user identity handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
}

impl ChatMessage {
    /// Build a new outgoing text message with a time-ordered local id.
    pub fn compose(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: local_message_id(),
            content: content.into(),
            sender_id: sender_id.into(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
            message_type: MessageType::Text,
        }
    }

    /// Same id, or same sender and content sent within one second.
    pub fn is_duplicate_of(&self, other: &ChatMessage) -> bool {
        if self.id == other.id {
            return true;
        }
        self.sender_id == other.sender_id
            && self.content == other.content
            && (self.timestamp - other.timestamp).num_milliseconds().abs() <= 1000
    }
}

pub(crate) fn local_message_id() -> String {
    format!("local-{}", uuid::Uuid::now_v7())
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    CallInit,
    CallAccept,
    CallReject,
    Offer,
    Answer,
    Candidate,
    CallEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub conversation_id: String,
    pub from_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<String>,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub is_video: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl CallSignal {
    pub fn new(
        signal_type: SignalType,
        conversation_id: impl Into<String>,
        from_user_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            from_user_id: from_user_id.into(),
            to_user_id: None,
            signal_type,
            payload: None,
            is_video: false,
            timestamp: Utc::now(),
        }
    }

    pub fn to(mut self, user_id: Option<String>) -> Self {
        self.to_user_id = user_id;
        self
    }

    pub fn video(mut self, is_video: bool) -> Self {
        self.is_video = is_video;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Connected,
    Ending,
}

impl Default for CallState {
    fn default() -> Self {
        Self::Idle
    }
}

impl CallState {
    /// Edges of the call state machine. Every state may fall back to `Idle`.
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle, Outgoing) | (Idle, Incoming) => true,
            (Incoming, Outgoing) | (Incoming, Ending) => true,
            (Outgoing, Connected) | (Outgoing, Ending) => true,
            (Connected, Ending) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        self != CallState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiation document exchanged in OFFER and ANSWER signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate exchanged in CANDIDATE signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_call_signal_wire_format() {
        let signal = CallSignal::new(SignalType::CallInit, "42", "u1").video(true);
        let json = serde_json::to_value(&signal).unwrap();

        assert_eq!(json["type"], "CALL_INIT");
        assert_eq!(json["conversationId"], "42");
        assert_eq!(json["fromUserId"], "u1");
        assert_eq!(json["isVideo"], true);
        assert!(json.get("toUserId").is_none());
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let candidate: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_duplicate_detection() {
        let first = ChatMessage::compose("7", "u1", "hello");
        let mut echo = first.clone();
        echo.id = "srv-1".to_string();
        echo.timestamp = first.timestamp + Duration::milliseconds(800);
        assert!(echo.is_duplicate_of(&first));

        echo.timestamp = first.timestamp + Duration::milliseconds(1500);
        assert!(!echo.is_duplicate_of(&first));

        let mut other_sender = first.clone();
        other_sender.id = "srv-2".to_string();
        other_sender.sender_id = "u2".to_string();
        assert!(!other_sender.is_duplicate_of(&first));
    }

    #[test]
    fn test_call_state_edges() {
        assert!(CallState::Idle.can_transition_to(CallState::Outgoing));
        assert!(CallState::Idle.can_transition_to(CallState::Incoming));
        assert!(!CallState::Idle.can_transition_to(CallState::Connected));
        assert!(!CallState::Incoming.can_transition_to(CallState::Connected));
        assert!(CallState::Connected.can_transition_to(CallState::Idle));
        assert!(CallState::Ending.can_transition_to(CallState::Idle));
        assert!(!CallState::Ending.can_transition_to(CallState::Connected));
    }
}
