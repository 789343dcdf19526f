use chrono::Utc;
use shared::{
    domain::{FileId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatMessage, Credentials, LoginResponse, OutgoingMessage},
};
use storage::{Storage, StoredFile, StoredMessage};
use tracing::{info, warn};

pub mod auth;

use auth::AuthConfig;

pub const MAX_TEXT_CHARS: usize = 4096;
pub const MAX_USERNAME_CHARS: usize = 64;
pub const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_FILENAME_BYTES: usize = 180;
pub const FILE_URL_PREFIX: &str = "/files/";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
    pub allow_guests: bool,
}

pub async fn register(ctx: &ApiContext, credentials: &Credentials) -> Result<UserId, ApiError> {
    let username = validate_username(&credentials.username)?;
    if credentials.password.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "password cannot be empty",
        ));
    }

    let hash = auth::hash_password(&credentials.password)?;
    let user_id = ctx
        .storage
        .create_user(username, &hash)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "username already exists"))?;
    info!(user_id = user_id.0, %username, "registered user");
    Ok(user_id)
}

pub async fn login(ctx: &ApiContext, credentials: &Credentials) -> Result<LoginResponse, ApiError> {
    let rejected = || ApiError::new(ErrorCode::Unauthorized, "invalid username or password");

    let (user_id, hash) = ctx
        .storage
        .credentials_for(credentials.username.trim())
        .await
        .map_err(internal)?
        .ok_or_else(rejected)?;
    if !auth::verify_password(&credentials.password, &hash) {
        warn!(user_id = user_id.0, "login rejected: wrong password");
        return Err(rejected());
    }

    let token = auth::mint_token(&ctx.auth, user_id)?;
    Ok(LoginResponse { token, user_id })
}

/// Resolves a bearer token to a user that still exists.
pub async fn authenticate_token(ctx: &ApiContext, token: &str) -> Result<UserId, ApiError> {
    let user_id = auth::verify_token(&ctx.auth, token)?;
    if !ctx.storage.user_exists(user_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::Unauthorized, "unknown user"));
    }
    Ok(user_id)
}

pub async fn authenticate_guest(ctx: &ApiContext, name: &str) -> Result<UserId, ApiError> {
    if !ctx.allow_guests {
        return Err(ApiError::new(
            ErrorCode::Unauthorized,
            "guest access is disabled",
        ));
    }
    let name = validate_username(name)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "guest name may only contain letters, digits, '-' and '_'",
        ));
    }
    ctx.storage
        .ensure_guest_user(name)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "name belongs to a registered user"))
}

/// Guest counterpart of [`login`]: resolves the guest name and issues a token.
pub async fn guest_login(ctx: &ApiContext, name: &str) -> Result<LoginResponse, ApiError> {
    let user_id = authenticate_guest(ctx, name).await?;
    let token = auth::mint_token(&ctx.auth, user_id)?;
    info!(user_id = user_id.0, guest = name.trim(), "guest session issued");
    Ok(LoginResponse { token, user_id })
}

/// Validates an inbound envelope, stamps it with server-side identity and
/// persists it as unread.
pub async fn accept_message(
    ctx: &ApiContext,
    sender_id: UserId,
    outgoing: OutgoingMessage,
) -> Result<ChatMessage, ApiError> {
    if outgoing.content.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message content cannot be empty",
        ));
    }

    if outgoing.kind.is_attachment() {
        let file_id = file_id_from_url(&outgoing.content).ok_or_else(|| {
            ApiError::new(
                ErrorCode::Validation,
                "attachment content must be an upload url",
            )
        })?;
        if !ctx.storage.file_exists(file_id).await.map_err(internal)? {
            return Err(ApiError::new(ErrorCode::NotFound, "attachment not found"));
        }
    } else if outgoing.content.chars().count() > MAX_TEXT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("text exceeds {MAX_TEXT_CHARS} characters"),
        ));
    }

    if !ctx
        .storage
        .user_exists(outgoing.receiver_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::NotFound, "receiver not found"));
    }

    if let Some(reply_to) = outgoing.reply_to {
        ctx.storage
            .load_message(reply_to)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "quoted message not found"))?;
    }

    let message = ChatMessage {
        id: MessageId::new_v4(),
        kind: outgoing.kind,
        sender_id,
        receiver_id: outgoing.receiver_id,
        content: outgoing.content,
        reply_to: outgoing.reply_to,
        is_read: false,
        created_at: Utc::now(),
    };
    ctx.storage
        .insert_message(&StoredMessage::from(&message))
        .await
        .map_err(internal)?;
    Ok(message)
}

pub async fn undelivered_messages(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ChatMessage>, ApiError> {
    let messages = ctx
        .storage
        .list_undelivered(user_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(ChatMessage::from).collect())
}

pub async fn mark_delivered(ctx: &ApiContext, message_id: MessageId) -> Result<(), ApiError> {
    ctx.storage
        .mark_delivered(message_id)
        .await
        .map_err(internal)?;
    Ok(())
}

/// Stores an upload and returns the URL clients put into image/audio envelopes.
pub async fn store_upload(
    ctx: &ApiContext,
    filename: Option<&str>,
    mime_type: Option<&str>,
    body: &[u8],
) -> Result<String, ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "upload body cannot be empty",
        ));
    }
    if body.len() > MAX_ATTACHMENT_BYTES {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("upload exceeds {MAX_ATTACHMENT_BYTES} bytes"),
        ));
    }

    let filename = filename.map(str::trim).filter(|name| !name.is_empty());
    if let Some(name) = filename {
        if name.len() > MAX_FILENAME_BYTES {
            return Err(ApiError::new(ErrorCode::Validation, "filename is too long"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "filename must not contain path separators",
            ));
        }
    }
    let mime_type = mime_type.map(str::trim).filter(|mime| !mime.is_empty());

    let file_id = ctx
        .storage
        .store_file(body, mime_type, filename)
        .await
        .map_err(internal)?;
    info!(file_id = file_id.0, size_bytes = body.len(), "stored upload");
    Ok(file_url(file_id))
}

pub async fn load_upload(ctx: &ApiContext, file_id: FileId) -> Result<StoredFile, ApiError> {
    ctx.storage
        .load_file(file_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "file not found"))
}

pub fn file_url(file_id: FileId) -> String {
    format!("{FILE_URL_PREFIX}{}", file_id.0)
}

/// Accepts both the relative form and an absolute URL ending in `/files/{id}`.
pub fn file_id_from_url(url: &str) -> Option<FileId> {
    let (_, tail) = url.trim().rsplit_once(FILE_URL_PREFIX)?;
    let id = tail.split(['?', '#']).next()?;
    id.parse::<i64>().ok().filter(|id| *id > 0).map(FileId)
}

fn validate_username(raw: &str) -> Result<&str, ApiError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        ));
    }
    if username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("username exceeds {MAX_USERNAME_CHARS} characters"),
        ));
    }
    Ok(username)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
