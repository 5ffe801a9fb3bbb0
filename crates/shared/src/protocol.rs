use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, MessageId, MessageKind, MessageStatus, Participant,
        UserId, UserStatus,
    },
    error::ApiError,
};

/// A message as it travels over the wire and REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub updated_at: DateTime<Utc>,
}

/// `message:send` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Direct-message shortcut: resolves (or creates) the direct
    /// conversation with this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
}

/// Frames the client sends after the WebSocket upgrade. Event names are the
/// wire contract and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Handshake authentication; must be the first frame.
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "message:send")]
    MessageSend(SendMessageRequest),
    #[serde(rename = "message:read")]
    MessageRead(MarkReadRequest),
    #[serde(rename = "typing:start")]
    TypingStart(TypingTarget),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingTarget),
    #[serde(rename = "user:status")]
    StatusChange { status: UserStatus },
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:sent")]
    MessageSent {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "tempId")]
        temp_id: Option<String>,
    },
    #[serde(rename = "message:new")]
    MessageNew(MessagePayload),
    #[serde(rename = "message:read:ack")]
    MessageReadAck {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        #[serde(rename = "messageIds")]
        message_ids: Vec<MessageId>,
        #[serde(rename = "readBy")]
        read_by: UserId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    #[serde(rename = "message:error")]
    MessageError { error: ApiError },
    #[serde(rename = "typing:update")]
    TypingUpdate {
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "user:status")]
    UserStatus {
        #[serde(rename = "userId")]
        user_id: UserId,
        status: UserStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageKind, MessageStatus};

    #[test]
    fn client_events_decode_by_wire_name() {
        let frame = r#"{"event":"message:send","data":{"content":"hi","type":"text"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).expect("decode");
        match event {
            ClientEvent::MessageSend(req) => {
                assert_eq!(req.content, "hi");
                assert_eq!(req.kind, MessageKind::Text);
                assert!(req.conversation_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let frame = r#"{"event":"typing:start","data":{}}"#;
        assert!(matches!(
            serde_json::from_str::<ClientEvent>(frame).expect("decode"),
            ClientEvent::TypingStart(_)
        ));

        let frame = r#"{"event":"user:status","data":{"status":"away"}}"#;
        assert!(matches!(
            serde_json::from_str::<ClientEvent>(frame).expect("decode"),
            ClientEvent::StatusChange {
                status: UserStatus::Away
            }
        ));
    }

    #[test]
    fn server_events_encode_with_wire_names() {
        let event = ServerEvent::MessageSent {
            message_id: MessageId::generate(),
            status: MessageStatus::Sent,
            temp_id: None,
        };
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json["event"], "message:sent");
        assert_eq!(json["data"]["status"], "sent");

        let event = ServerEvent::TypingUpdate {
            user_id: UserId::generate(),
            is_typing: true,
        };
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json["event"], "typing:update");
        assert_eq!(json["data"]["isTyping"], true);
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let frame = r#"{"event":"chat:send","data":{}}"#;
        assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn message_payload_uses_camel_case_fields() {
        let payload = MessagePayload {
            id: MessageId::generate(),
            conversation_id: ConversationId::generate(),
            sender_id: UserId::generate(),
            content: "hello".into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            metadata: None,
        };
        let json = serde_json::to_value(&payload).expect("encode");
        assert!(json.get("conversationId").is_some());
        assert!(json.get("senderId").is_some());
        assert_eq!(json["type"], "text");
    }
}
