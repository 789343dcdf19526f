use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Body of both `POST /register` and `POST /login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: UserId,
}

/// Envelope a client pushes onto its socket. Identity and timestamps are
/// filled in by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// Envelope as relayed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: ApiError,
}

/// Anything the server writes to a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message(ChatMessage),
    Error(ErrorFrame),
}

impl ServerFrame {
    pub fn error(error: ApiError) -> Self {
        ServerFrame::Error(ErrorFrame { error })
    }
}

impl From<ChatMessage> for ServerFrame {
    fn from(message: ChatMessage) -> Self {
        ServerFrame::Message(message)
    }
}
