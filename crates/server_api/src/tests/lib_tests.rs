use super::*;
use shared::domain::MessageKind;

async fn setup(allow_guests: bool) -> ApiContext {
    ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        auth: AuthConfig {
            jwt_secret: "secret".to_string(),
            token_ttl_seconds: 60,
        },
        allow_guests,
    }
}

fn creds(username: &str, password: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }
}

fn text_to(receiver_id: UserId, content: &str) -> OutgoingMessage {
    OutgoingMessage {
        kind: MessageKind::Text,
        receiver_id,
        content: content.to_string(),
        reply_to: None,
    }
}

#[tokio::test]
async fn register_then_login_issues_verifiable_token() {
    let ctx = setup(false).await;
    let user_id = register(&ctx, &creds("alice", "pw")).await.expect("register");

    let session = login(&ctx, &creds("alice", "pw")).await.expect("login");
    assert_eq!(session.user_id, user_id);
    assert_eq!(
        authenticate_token(&ctx, &session.token).await.expect("token"),
        user_id
    );
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let ctx = setup(false).await;
    register(&ctx, &creds("alice", "pw")).await.expect("register");
    let err = register(&ctx, &creds("alice", "other"))
        .await
        .expect_err("duplicate");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn register_validates_input() {
    let ctx = setup(false).await;
    let err = register(&ctx, &creds("   ", "pw")).await.expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);
    let err = register(&ctx, &creds("bob", "")).await.expect_err("no pw");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn wrong_password_and_unknown_user_look_the_same() {
    let ctx = setup(false).await;
    register(&ctx, &creds("alice", "pw")).await.expect("register");

    let wrong = login(&ctx, &creds("alice", "nope")).await.expect_err("wrong");
    let unknown = login(&ctx, &creds("mallory", "pw")).await.expect_err("unknown");
    assert_eq!(wrong, unknown);
    assert_eq!(wrong.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn guests_require_opt_in() {
    let closed = setup(false).await;
    let err = authenticate_guest(&closed, "guest-1").await.expect_err("closed");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let open = setup(true).await;
    let guest = authenticate_guest(&open, "guest-1").await.expect("guest");
    assert_eq!(
        authenticate_guest(&open, "guest-1").await.expect("again"),
        guest
    );
    let err = authenticate_guest(&open, "no spaces")
        .await
        .expect_err("bad name");
    assert_eq!(err.code, ErrorCode::Validation);

    register(&open, &creds("alice", "pw")).await.expect("register");
    let err = authenticate_guest(&open, "alice").await.expect_err("taken");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn guest_login_issues_token_for_guest_account() {
    let ctx = setup(true).await;
    let session = guest_login(&ctx, "guest-77").await.expect("guest");
    assert_eq!(
        authenticate_token(&ctx, &session.token).await.expect("token"),
        session.user_id
    );
}

#[tokio::test]
async fn accepted_message_gets_server_identity_and_is_queued() {
    let ctx = setup(false).await;
    let alice = register(&ctx, &creds("alice", "pw")).await.expect("alice");
    let bob = register(&ctx, &creds("bob", "pw")).await.expect("bob");

    let message = accept_message(&ctx, alice, text_to(bob, "hello"))
        .await
        .expect("accept");
    assert_eq!(message.sender_id, alice);
    assert_eq!(message.receiver_id, bob);
    assert!(!message.is_read);

    let pending = undelivered_messages(&ctx, bob).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, message.id);

    mark_delivered(&ctx, message.id).await.expect("mark");
    assert!(undelivered_messages(&ctx, bob).await.expect("pending").is_empty());
}

#[tokio::test]
async fn rejects_empty_text_and_unknown_receiver() {
    let ctx = setup(false).await;
    let alice = register(&ctx, &creds("alice", "pw")).await.expect("alice");

    let err = accept_message(&ctx, alice, text_to(alice, "  "))
        .await
        .expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = accept_message(&ctx, alice, text_to(UserId(999), "hi"))
        .await
        .expect_err("receiver");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn text_length_limit_counts_characters() {
    let ctx = setup(false).await;
    let alice = register(&ctx, &creds("alice", "pw")).await.expect("alice");
    let bob = register(&ctx, &creds("bob", "pw")).await.expect("bob");

    let longest = "é".repeat(MAX_TEXT_CHARS);
    let message = accept_message(&ctx, alice, text_to(bob, &longest))
        .await
        .expect("at limit");
    assert_eq!(message.content.chars().count(), MAX_TEXT_CHARS);

    let too_long = "a".repeat(MAX_TEXT_CHARS + 1);
    let err = accept_message(&ctx, alice, text_to(bob, &too_long))
        .await
        .expect_err("over limit");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn rejects_reply_to_unknown_message() {
    let ctx = setup(false).await;
    let alice = register(&ctx, &creds("alice", "pw")).await.expect("alice");
    let mut msg = text_to(alice, "re");
    msg.reply_to = Some(MessageId::new_v4());
    let err = accept_message(&ctx, alice, msg).await.expect_err("dangling");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn attachments_must_reference_stored_uploads() {
    let ctx = setup(false).await;
    let alice = register(&ctx, &creds("alice", "pw")).await.expect("alice");
    let bob = register(&ctx, &creds("bob", "pw")).await.expect("bob");

    let bogus = OutgoingMessage {
        kind: MessageKind::Image,
        receiver_id: bob,
        content: "https://elsewhere.example/cat.png".to_string(),
        reply_to: None,
    };
    let err = accept_message(&ctx, alice, bogus).await.expect_err("not upload");
    assert_eq!(err.code, ErrorCode::Validation);

    let missing = OutgoingMessage {
        kind: MessageKind::Audio,
        receiver_id: bob,
        content: "/files/77".to_string(),
        reply_to: None,
    };
    let err = accept_message(&ctx, alice, missing).await.expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);

    let url = store_upload(&ctx, Some("cat.png"), Some("image/png"), b"png")
        .await
        .expect("upload");
    let image = OutgoingMessage {
        kind: MessageKind::Image,
        receiver_id: bob,
        content: url.clone(),
        reply_to: None,
    };
    let accepted = accept_message(&ctx, alice, image).await.expect("image");
    assert_eq!(accepted.content, url);
}

#[tokio::test]
async fn upload_validation() {
    let ctx = setup(false).await;
    let err = store_upload(&ctx, None, None, b"").await.expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = store_upload(&ctx, Some("../etc/passwd"), None, b"x")
        .await
        .expect_err("separator");
    assert_eq!(err.code, ErrorCode::Validation);

    let url = store_upload(&ctx, Some("  "), Some(""), b"x").await.expect("ok");
    let file = load_upload(&ctx, file_id_from_url(&url).expect("id"))
        .await
        .expect("load");
    assert!(file.filename.is_none());
    assert!(file.mime_type.is_none());
}

#[test]
fn parses_file_ids_from_relative_and_absolute_urls() {
    assert_eq!(file_id_from_url("/files/12"), Some(FileId(12)));
    assert_eq!(
        file_id_from_url("http://localhost:8080/files/7?dl=1"),
        Some(FileId(7))
    );
    assert_eq!(file_id_from_url("/files/abc"), None);
    assert_eq!(file_id_from_url("/files/0"), None);
    assert_eq!(file_id_from_url("hello"), None);
    assert_eq!(file_url(FileId(3)), "/files/3");
}
