use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::{multipart, Client, Response};
use serde::Serialize;
use shared::{
    domain::{MessageId, MessageKind, UserId},
    error::{ApiError, ApiException},
    protocol::{Credentials, LoginResponse, OutgoingMessage},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub mod dispatch;

pub use dispatch::{InboundMessage, MessageBody};

const GUEST_SUFFIX_CHARS: usize = 8;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { user_id: UserId },
    Message(InboundMessage),
    /// The server rejected one of our frames; the connection stays up.
    ServerError(ApiError),
    Error(String),
    /// Terminal: a new login and `connect` are required afterwards.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("no receiver selected")]
    MissingTarget,
    #[error("not connected")]
    NotConnected,
}

#[derive(Serialize)]
struct GuestRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    user_id: UserId,
}

struct ChatClientState {
    session: Option<Session>,
    replying_to: Option<MessageId>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connection: u64,
}

pub struct ChatClient {
    http: Client,
    server_url: String,
    inner: Mutex<ChatClientState>,
    events: broadcast::Sender<ClientEvent>,
}

/// `guest-` followed by eight random hex characters.
pub fn guest_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("guest-{}", &suffix[..GUEST_SUFFIX_CHARS])
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Arc::new(Self {
            http: Client::new(),
            server_url,
            inner: Mutex::new(ChatClientState {
                session: None,
                replying_to: None,
                outbound: None,
                connection: 0,
            }),
            events,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        let guard = self.inner.lock().await;
        guard.session.as_ref().map(|session| session.user_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.outbound.is_some()
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/register", self.server_url))
            .json(&Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("register request failed")?;
        check_status(res).await?;
        info!(%username, "registered account");
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserId> {
        let res = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("login request failed")?;
        let body: LoginResponse = check_status(res).await?.json().await?;
        Ok(self.start_session(body).await)
    }

    pub async fn login_as_guest(&self, name: &str) -> Result<UserId> {
        let res = self
            .http
            .post(format!("{}/guest", self.server_url))
            .json(&GuestRequest { name })
            .send()
            .await
            .context("guest login request failed")?;
        let body: LoginResponse = check_status(res).await?.json().await?;
        Ok(self.start_session(body).await)
    }

    /// Guest login followed by [`ChatClient::connect`].
    pub async fn connect_as_guest(self: &Arc<Self>, name: &str) -> Result<UserId> {
        let user_id = self.login_as_guest(name).await?;
        self.connect().await?;
        Ok(user_id)
    }

    async fn start_session(&self, body: LoginResponse) -> UserId {
        let mut guard = self.inner.lock().await;
        // dropping the sender closes any socket from a previous session
        guard.outbound = None;
        guard.connection += 1;
        guard.replying_to = None;
        guard.session = Some(Session {
            token: body.token,
            user_id: body.user_id,
        });
        body.user_id
    }

    /// Opens the single WebSocket of this session. Inbound frames are
    /// published on [`ChatClient::subscribe_events`] in arrival order.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let session = {
            let guard = self.inner.lock().await;
            if guard.outbound.is_some() {
                bail!("already connected");
            }
            guard
                .session
                .clone()
                .ok_or_else(|| anyhow!("login before connecting"))?
        };

        let ws_url = websocket_url(&self.server_url, &session.token)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket to {}", self.server_url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let connection = {
            let mut guard = self.inner.lock().await;
            guard.connection += 1;
            guard.outbound = Some(tx);
            guard.connection
        };
        let user_id = session.user_id;
        info!(user_id = user_id.0, "websocket connected");
        let _ = self.events.send(ClientEvent::Connected { user_id });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = ws_writer.send(msg).await {
                    warn!(%err, "websocket write failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = client
                            .events
                            .send(dispatch::dispatch_frame(&text, Some(user_id)));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("websocket error: {err}")));
                        break;
                    }
                }
            }
            client.connection_closed(connection).await;
        });

        Ok(())
    }

    async fn connection_closed(&self, connection: u64) {
        {
            let mut guard = self.inner.lock().await;
            if guard.connection != connection {
                return;
            }
            guard.outbound = None;
            guard.session = None;
            guard.replying_to = None;
        }
        info!("websocket closed");
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    /// Closes the socket; a `Disconnected` event follows once the server
    /// acknowledges.
    pub async fn disconnect(&self) {
        self.inner.lock().await.outbound = None;
    }

    /// Marks `message_id` as the message the next send replies to and returns
    /// the preview to show while composing.
    pub async fn set_reply(&self, message_id: MessageId, content: &str) -> String {
        self.inner.lock().await.replying_to = Some(message_id);
        dispatch::reply_preview(content)
    }

    pub async fn cancel_reply(&self) {
        self.inner.lock().await.replying_to = None;
    }

    pub async fn replying_to(&self) -> Option<MessageId> {
        self.inner.lock().await.replying_to
    }

    pub async fn send_text(&self, receiver: Option<UserId>, text: &str) -> Result<OutgoingMessage> {
        self.send(MessageKind::Text, receiver, text).await
    }

    /// Uploads the file, then sends an `image` message when the MIME type is an
    /// image and an `audio` message otherwise.
    pub async fn upload_file(
        &self,
        receiver: Option<UserId>,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<OutgoingMessage> {
        if bytes.is_empty() {
            return Err(ComposeError::EmptyContent.into());
        }
        if receiver.is_none() {
            return Err(ComposeError::MissingTarget.into());
        }
        if !self.is_connected().await {
            return Err(ComposeError::NotConnected.into());
        }

        let url = self.upload_attachment(filename, mime_type, bytes).await?;
        self.send(MessageKind::for_mime(mime_type), receiver, &url)
            .await
    }

    /// Posts the file to `/upload` and returns the URL the server assigned.
    pub async fn upload_attachment(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let size_bytes = bytes.len();
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .with_context(|| format!("invalid MIME type '{mime_type}'"))?;
        let form = multipart::Form::new().part("file", part);
        let res = self
            .http
            .post(format!("{}/upload", self.server_url))
            .multipart(form)
            .send()
            .await
            .context("upload request failed")?;
        let url = check_status(res).await?.text().await?;
        info!(%filename, size_bytes, "uploaded attachment");
        Ok(url.trim().to_string())
    }

    /// Absolute form of a server-relative URL such as an attachment link.
    pub fn resolve_url(&self, url: &str) -> String {
        match Url::parse(&self.server_url).and_then(|base| base.join(url)) {
            Ok(resolved) => resolved.to_string(),
            Err(_) => url.to_string(),
        }
    }

    async fn send(
        &self,
        kind: MessageKind,
        receiver: Option<UserId>,
        content: &str,
    ) -> Result<OutgoingMessage> {
        let mut guard = self.inner.lock().await;
        let outgoing = compose(kind, receiver, content, guard.replying_to)?;
        let outbound = guard.outbound.as_ref().ok_or(ComposeError::NotConnected)?;
        let frame = serde_json::to_string(&outgoing)?;
        outbound
            .send(Message::Text(frame))
            .map_err(|_| ComposeError::NotConnected)?;
        guard.replying_to = None;
        Ok(outgoing)
    }
}

fn compose(
    kind: MessageKind,
    receiver: Option<UserId>,
    content: &str,
    reply_to: Option<MessageId>,
) -> Result<OutgoingMessage, ComposeError> {
    if content.trim().is_empty() {
        return Err(ComposeError::EmptyContent);
    }
    let receiver_id = receiver.ok_or(ComposeError::MissingTarget)?;
    Ok(OutgoingMessage {
        kind,
        receiver_id,
        content: content.to_string(),
        reply_to,
    })
}

fn websocket_url(server_url: &str, token: &str) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url '{server_url}'"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => bail!("server_url must start with http:// or https://"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket url from {server_url}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

async fn check_status(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => Err(ApiException::from(error).into()),
        Err(_) => Err(anyhow!("request failed with {status}: {body}")),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
