use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{FileId, MessageId, MessageKind, UserId},
    protocol::ChatMessage,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for ChatMessage {
    fn from(m: StoredMessage) -> Self {
        ChatMessage {
            id: m.message_id,
            kind: m.kind,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            content: m.content,
            reply_to: m.reply_to,
            is_read: m.is_read,
            created_at: m.created_at,
        }
    }
}

impl From<&ChatMessage> for StoredMessage {
    fn from(m: &ChatMessage) -> Self {
        StoredMessage {
            message_id: m.id,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            kind: m.kind,
            content: m.content.clone(),
            reply_to: m.reply_to,
            is_read: m.is_read,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: FileId,
    pub body: Vec<u8>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub size_bytes: u64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` is a distinct database, so the
        // pool must hold on to exactly one.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns `None` when the username is already taken.
    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "INSERT INTO users (username, password_hash) VALUES (?, ?)
             ON CONFLICT(username) DO NOTHING
             RETURNING id",
        )
        .bind(username)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    /// Get-or-create a password-less account. Returns `None` if the name
    /// belongs to a registered user.
    pub async fn ensure_guest_user(&self, name: &str) -> Result<Option<UserId>> {
        let existing = sqlx::query("SELECT id, password_hash FROM users WHERE username = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            if row.get::<Option<String>, _>(1).is_some() {
                return Ok(None);
            }
            return Ok(Some(UserId(row.get::<i64, _>(0))));
        }

        let rec = sqlx::query(
            "INSERT INTO users (username, password_hash) VALUES (?, NULL)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id, password_hash",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        if rec.get::<Option<String>, _>(1).is_some() {
            return Ok(None);
        }
        Ok(Some(UserId(rec.get::<i64, _>(0))))
    }

    /// Id and password hash of a registered account. Guests have no hash and
    /// are not returned.
    pub async fn credentials_for(&self, username: &str) -> Result<Option<(UserId, String)>> {
        let row = sqlx::query(
            "SELECT id, password_hash FROM users WHERE username = ? AND password_hash IS NOT NULL",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1))))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, sender_id, receiver_id, content, kind, reply_to, is_read, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id.to_string())
        .bind(message.sender_id.0)
        .bind(message.receiver_id.0)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.reply_to.map(|id| id.to_string()))
        .bind(message.is_read)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert message {}", message.message_id))?;
        Ok(())
    }

    /// Unread messages addressed to `receiver_id`, oldest first.
    pub async fn list_undelivered(&self, receiver_id: UserId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, kind, reply_to, is_read, created_at
             FROM messages
             WHERE receiver_id = ? AND is_read = 0
             ORDER BY rowid ASC",
        )
        .bind(receiver_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn count_undelivered(&self, receiver_id: UserId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0")
                .bind(receiver_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn mark_delivered(&self, message_id: MessageId) -> Result<bool> {
        let affected = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ? AND is_read = 0")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, kind, reply_to, is_read, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn store_file(
        &self,
        body: &[u8],
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> Result<FileId> {
        let rec = sqlx::query(
            "INSERT INTO files (filename, mime_type, size_bytes, body) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(filename)
        .bind(mime_type)
        .bind(i64::try_from(body.len()).unwrap_or(i64::MAX))
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(FileId(rec.get::<i64, _>(0)))
    }

    pub async fn load_file(&self, file_id: FileId) -> Result<Option<StoredFile>> {
        let row = sqlx::query("SELECT id, body, mime_type, filename, size_bytes FROM files WHERE id = ?")
            .bind(file_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredFile {
            file_id: FileId(r.get::<i64, _>(0)),
            body: r.get::<Vec<u8>, _>(1),
            mime_type: r.get::<Option<String>, _>(2),
            filename: r.get::<Option<String>, _>(3),
            size_bytes: u64::try_from(r.get::<i64, _>(4)).unwrap_or_default(),
        }))
    }

    pub async fn file_exists(&self, file_id: FileId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM files WHERE id = ?")
            .bind(file_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let id: String = r.try_get("id")?;
    let kind: String = r.try_get("kind")?;
    let reply_to: Option<String> = r.try_get("reply_to")?;
    Ok(StoredMessage {
        message_id: id
            .parse::<MessageId>()
            .with_context(|| format!("corrupt message id '{id}'"))?,
        sender_id: UserId(r.try_get("sender_id")?),
        receiver_id: UserId(r.try_get("receiver_id")?),
        kind: kind.parse::<MessageKind>().map_err(|e| anyhow!(e))?,
        content: r.try_get("content")?,
        reply_to: reply_to
            .map(|raw| raw.parse::<MessageId>())
            .transpose()
            .context("corrupt reply_to id")?,
        is_read: r.try_get("is_read")?,
        created_at: r.try_get("created_at")?,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
