use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{ChatMessage, ServerFrame},
};

use crate::ClientEvent;

const QUOTE_PREFIX_CHARS: usize = 8;
const REPLY_PREVIEW_CHARS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Image(String),
    Audio(String),
}

impl MessageBody {
    fn from_message(message: &ChatMessage) -> Self {
        match message.kind {
            MessageKind::Text => Self::Text(message.content.clone()),
            MessageKind::Image => Self::Image(message.content.clone()),
            MessageKind::Audio => Self::Audio(message.content.clone()),
        }
    }
}

/// A server-pushed message prepared for display.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message: ChatMessage,
    /// Sent by the current user (an echo of our own send).
    pub mine: bool,
    /// Worth an audible notification.
    pub notify: bool,
    pub quote: Option<String>,
    pub body: MessageBody,
}

impl InboundMessage {
    pub fn new(message: ChatMessage, me: Option<UserId>) -> Self {
        let mine = me == Some(message.sender_id);
        let quote = message.reply_to.map(|id| quote_preview(&id));
        let body = MessageBody::from_message(&message);
        Self {
            message,
            mine,
            notify: !mine,
            quote,
            body,
        }
    }
}

/// Classifies one text frame from the server.
pub fn dispatch_frame(text: &str, me: Option<UserId>) -> ClientEvent {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Message(message)) => {
            ClientEvent::Message(InboundMessage::new(message, me))
        }
        Ok(ServerFrame::Error(frame)) => ClientEvent::ServerError(frame.error),
        Err(err) => ClientEvent::Error(format!("invalid server frame: {err}")),
    }
}

pub fn quote_preview(id: &MessageId) -> String {
    format!("{}...", take_chars(&id.to_string(), QUOTE_PREFIX_CHARS))
}

pub fn reply_preview(content: &str) -> String {
    format!("{}...", take_chars(content, REPLY_PREVIEW_CHARS))
}

fn take_chars(value: &str, count: usize) -> &str {
    match value.char_indices().nth(count) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
