use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
};

/// Outbound events dispatched over the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientRequest {
    SendMessage {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        message: String,
        attachments: Vec<String>,
    },
    SeenMessage {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    JoinOnlineTrack {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
}

/// Wire shape of a confirmed message, shared by the live channel and the
/// paginated history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// Directory entry as served by `GET /chats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub counterpart_id: UserId,
    pub counterpart_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Inbound events delivered over the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage {
        message: MessagePayload,
    },
    NewSeen {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    Presence {
        #[serde(rename = "userId")]
        user_id: UserId,
        online: bool,
    },
    Error(ApiError),
}

impl ServerEvent {
    /// Dispatch key for the transport's named-handler registry. Presence is
    /// keyed per subscribed user so trackers only observe users they asked
    /// for.
    pub fn dispatch_key(&self) -> String {
        match self {
            ServerEvent::NewMessage { .. } => "newMessage".to_string(),
            ServerEvent::NewSeen { .. } => "newSeen".to_string(),
            ServerEvent::Presence { user_id, .. } => presence_key(*user_id),
            ServerEvent::Error(_) => "error".to_string(),
        }
    }
}

pub fn presence_key(user_id: UserId) -> String {
    format!("online:{}", user_id.0)
}
