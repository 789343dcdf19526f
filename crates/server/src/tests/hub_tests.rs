use super::*;
use shared::error::{ApiError, ErrorCode};

fn frame(message: &str) -> ServerFrame {
    ServerFrame::error(ApiError::new(ErrorCode::Validation, message))
}

#[tokio::test]
async fn delivers_only_to_online_users() {
    let hub = Hub::new();
    let mut reg = hub.register(UserId(1)).await;

    assert!(hub.deliver(UserId(1), frame("a")).await);
    assert!(!hub.deliver(UserId(2), frame("b")).await);
    assert_eq!(reg.rx.recv().await, Some(frame("a")));
}

#[tokio::test]
async fn newer_connection_replaces_older_one() {
    let hub = Hub::new();
    let mut first = hub.register(UserId(1)).await;
    let mut second = hub.register(UserId(1)).await;
    assert_ne!(first.seq, second.seq);

    // the old queue is closed once its sender is dropped
    assert_eq!(first.rx.recv().await, None);

    assert!(!hub.unregister(UserId(1), first.seq).await);
    assert!(hub.is_online(UserId(1)).await);

    assert!(!hub.deliver_to_session(UserId(1), first.seq, frame("stale")).await);
    assert!(hub.deliver_to_session(UserId(1), second.seq, frame("fresh")).await);
    assert_eq!(second.rx.recv().await, Some(frame("fresh")));

    assert!(hub.unregister(UserId(1), second.seq).await);
    assert!(!hub.is_online(UserId(1)).await);
}
