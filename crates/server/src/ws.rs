use std::{collections::HashSet, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use server_api::{accept_message, mark_delivered, undelivered_messages};
use shared::{
    domain::{MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatMessage, OutgoingMessage, ServerFrame},
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, hub::Registration};

pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    // Register before reading the backlog so nothing sent in between is missed.
    let Registration { seq, rx } = state.hub.register(user_id).await;
    info!(user_id = user_id.0, seq, "websocket connected");

    let backlog = match undelivered_messages(&state.api, user_id).await {
        Ok(backlog) => backlog,
        Err(error) => {
            warn!(user_id = user_id.0, %error, "failed to load offline messages");
            Vec::new()
        }
    };

    let writer_state = Arc::clone(&state);
    let mut send_task = tokio::spawn(async move {
        if push_frames(&writer_state, user_id, backlog, rx, &mut sender).await {
            let _ = sender.send(Message::Close(None)).await;
        }
    });

    let reader_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_text(&reader_state, user_id, seq, &text).await,
                Ok(Message::Binary(_)) => {
                    reject(
                        &reader_state,
                        user_id,
                        seq,
                        ApiError::new(ErrorCode::Validation, "binary frames are not supported"),
                    )
                    .await
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    debug!(user_id = user_id.0, %error, "websocket receive failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(user_id, seq).await;
    info!(user_id = user_id.0, seq, "websocket disconnected");
}

/// Writes the offline backlog, then the live queue, to `sink`. A message
/// addressed to `user_id` is marked delivered only after its frame has been
/// written, and is written at most once. Returns `false` if a write failed.
async fn push_frames<S>(
    state: &AppState,
    user_id: UserId,
    backlog: Vec<ChatMessage>,
    rx: UnboundedReceiver<ServerFrame>,
    sink: &mut S,
) -> bool
where
    S: Sink<Message> + Unpin,
{
    if !backlog.is_empty() {
        info!(user_id = user_id.0, count = backlog.len(), "pushing offline messages");
    }
    let mut pushed: HashSet<MessageId> = HashSet::with_capacity(backlog.len());
    let backlog = backlog.into_iter().map(ServerFrame::from);
    let mut frames = futures::stream::iter(backlog).chain(UnboundedReceiverStream::new(rx));

    while let Some(frame) = frames.next().await {
        let addressed = match &frame {
            ServerFrame::Message(message) if message.receiver_id == user_id => Some(message.id),
            _ => None,
        };
        // a message can be both in the backlog and queued live
        if addressed.is_some_and(|message_id| pushed.contains(&message_id)) {
            continue;
        }
        let Some(text) = encode(&frame) else {
            continue;
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return false;
        }
        if let Some(message_id) = addressed {
            pushed.insert(message_id);
            if let Err(error) = mark_delivered(&state.api, message_id).await {
                warn!(%message_id, %error, "failed to mark message delivered");
            }
        }
    }
    true
}

async fn handle_text(state: &AppState, user_id: UserId, seq: u64, text: &str) {
    let outgoing = match serde_json::from_str::<OutgoingMessage>(text) {
        Ok(outgoing) => outgoing,
        Err(error) => {
            let error = ApiError::new(ErrorCode::Validation, format!("malformed envelope: {error}"));
            reject(state, user_id, seq, error).await;
            return;
        }
    };

    let message = match accept_message(&state.api, user_id, outgoing).await {
        Ok(message) => message,
        Err(error) => {
            reject(state, user_id, seq, error).await;
            return;
        }
    };

    let message_id = message.id;
    let receiver_id = message.receiver_id;
    let frame = ServerFrame::from(message);
    if !state.hub.deliver(receiver_id, frame.clone()).await {
        debug!(%message_id, receiver_id = receiver_id.0, "receiver offline; message queued");
    }

    if receiver_id != user_id {
        state.hub.deliver_to_session(user_id, seq, frame).await;
    }
}

async fn reject(state: &AppState, user_id: UserId, seq: u64, error: ApiError) {
    debug!(user_id = user_id.0, code = ?error.code, message = %error.message, "rejected frame");
    state
        .hub
        .deliver_to_session(user_id, seq, ServerFrame::error(error))
        .await;
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(error) => {
            warn!(%error, "failed to encode frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_relay_tests.rs"]
mod tests;
