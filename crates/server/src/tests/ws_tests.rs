use std::time::Duration;

use futures::{SinkExt, StreamExt};
use shared::{
    domain::{MessageKind, UserId},
    error::ErrorCode,
    protocol::{ChatMessage, Credentials, OutgoingMessage, ServerFrame},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(allow_guests: bool) -> (SocketAddr, Arc<AppState>) {
    let state = super::tests::test_state(allow_guests, 1024).await;
    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn signup(state: &AppState, username: &str) -> (UserId, String) {
    let creds = Credentials {
        username: username.to_string(),
        password: "pw".to_string(),
    };
    let user_id = server_api::register(&state.api, &creds)
        .await
        .expect("register");
    let session = server_api::login(&state.api, &creds).await.expect("login");
    (user_id, session.token)
}

async fn connect(addr: SocketAddr, state: &AppState, user_id: UserId, query: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws?{query}"))
        .await
        .expect("connect");
    wait_until_online(state, user_id).await;
    socket
}

async fn wait_until_online(state: &AppState, user_id: UserId) {
    for _ in 0..100 {
        if state.hub.is_online(user_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {user_id} never came online");
}

async fn wait_until_all_delivered(state: &AppState, user_id: UserId) {
    for _ in 0..100 {
        if state
            .api
            .storage
            .count_undelivered(user_id)
            .await
            .expect("count")
            == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("messages for user {user_id} were never marked delivered");
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server frame");
        }
    }
}

async fn next_message(socket: &mut Socket) -> ChatMessage {
    match next_frame(socket).await {
        ServerFrame::Message(message) => message,
        ServerFrame::Error(frame) => panic!("unexpected error frame: {:?}", frame.error),
    }
}

async fn send_text(socket: &mut Socket, receiver_id: UserId, content: &str) {
    let outgoing = OutgoingMessage {
        kind: MessageKind::Text,
        receiver_id,
        content: content.to_string(),
        reply_to: None,
    };
    socket
        .send(Message::Text(
            serde_json::to_string(&outgoing).expect("encode"),
        ))
        .await
        .expect("send");
}

#[tokio::test]
async fn live_message_reaches_receiver_and_echoes_to_sender() {
    let (addr, state) = spawn_server(false).await;
    let (alice, alice_token) = signup(&state, "alice").await;
    let (bob, bob_token) = signup(&state, "bob").await;

    let mut alice_ws = connect(addr, &state, alice, &format!("token={alice_token}")).await;
    let mut bob_ws = connect(addr, &state, bob, &format!("token={bob_token}")).await;

    send_text(&mut alice_ws, bob, "hi bob").await;

    let received = next_message(&mut bob_ws).await;
    assert_eq!(received.sender_id, alice);
    assert_eq!(received.content, "hi bob");

    let echo = next_message(&mut alice_ws).await;
    assert_eq!(echo.id, received.id);

    wait_until_all_delivered(&state, bob).await;
}

#[tokio::test]
async fn offline_messages_are_pushed_in_order_on_connect() {
    let (addr, state) = spawn_server(false).await;
    let (alice, alice_token) = signup(&state, "alice").await;
    let (bob, bob_token) = signup(&state, "bob").await;

    let mut alice_ws = connect(addr, &state, alice, &format!("token={alice_token}")).await;
    for content in ["one", "two", "three"] {
        send_text(&mut alice_ws, bob, content).await;
        // the echo means the message has been persisted
        next_message(&mut alice_ws).await;
    }
    assert_eq!(
        state
            .api
            .storage
            .count_undelivered(bob)
            .await
            .expect("count"),
        3
    );

    let mut bob_ws = connect(addr, &state, bob, &format!("token={bob_token}")).await;
    let mut contents = Vec::new();
    for _ in 0..3 {
        contents.push(next_message(&mut bob_ws).await.content);
    }
    assert_eq!(contents, ["one", "two", "three"]);
    wait_until_all_delivered(&state, bob).await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_survives() {
    let (addr, state) = spawn_server(false).await;
    let (alice, token) = signup(&state, "alice").await;
    let mut ws = connect(addr, &state, alice, &format!("token={token}")).await;

    ws.send(Message::Text("{not json".to_string()))
        .await
        .expect("send");
    match next_frame(&mut ws).await {
        ServerFrame::Error(frame) => assert_eq!(frame.error.code, ErrorCode::Validation),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_text(&mut ws, UserId(9999), "nobody").await;
    match next_frame(&mut ws).await {
        ServerFrame::Error(frame) => assert_eq!(frame.error.code, ErrorCode::NotFound),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_text(&mut ws, alice, "note to self").await;
    let message = next_message(&mut ws).await;
    assert_eq!(message.content, "note to self");
}

#[tokio::test]
async fn handshake_without_valid_token_is_rejected() {
    let (addr, _state) = spawn_server(false).await;
    for query in ["token=bogus", "", "id=guest-abc"] {
        match connect_async(format!("ws://{addr}/ws?{query}")).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401, "query {query:?}")
            }
            Err(other) => panic!("unexpected error for {query:?}: {other}"),
            Ok(_) => panic!("handshake for {query:?} should fail"),
        }
    }
}

#[tokio::test]
async fn guests_can_connect_when_enabled() {
    let (addr, state) = spawn_server(true).await;
    let (socket, _) = connect_async(format!("ws://{addr}/ws?id=guest-1a2b"))
        .await
        .expect("guest connect");
    drop(socket);
    assert!(state
        .api
        .storage
        .ensure_guest_user("guest-1a2b")
        .await
        .expect("lookup")
        .is_some());
}

#[tokio::test]
async fn newer_connection_closes_the_older_one() {
    let (addr, state) = spawn_server(false).await;
    let (alice, token) = signup(&state, "alice").await;
    let mut first = connect(addr, &state, alice, &format!("token={token}")).await;
    let _second = connect(addr, &state, alice, &format!("token={token}")).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old connection should be closed");
    assert!(state.hub.is_online(alice).await);
}
