use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use server_api::{auth::DEFAULT_TOKEN_TTL_SECONDS, MAX_ATTACHMENT_BYTES};

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";
/// Longest token lifetime the server will issue.
pub const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub allow_guests: bool,
    pub static_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: DEV_JWT_SECRET.into(),
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            allow_guests: false,
            static_dir: None,
            max_upload_bytes: MAX_ATTACHMENT_BYTES,
        }
    }
}

/// Keys accepted in `server.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    jwt_secret: Option<String>,
    token_ttl_hours: Option<i64>,
    allow_guests: Option<bool>,
    static_dir: Option<PathBuf>,
    max_upload_bytes: Option<usize>,
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml`, then environment. For each setting the
/// `APP__` variable wins over its short alias.
pub(crate) fn settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.bind_addr {
                    settings.server_bind = v;
                }
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.jwt_secret {
                    settings.jwt_secret = v;
                }
                if let Some(v) = file_cfg.token_ttl_hours.and_then(ttl_seconds_from_hours) {
                    settings.token_ttl_seconds = v;
                }
                if let Some(v) = file_cfg.allow_guests {
                    settings.allow_guests = v;
                }
                if let Some(v) = file_cfg.static_dir {
                    settings.static_dir = Some(v);
                }
                if let Some(v) = file_cfg.max_upload_bytes {
                    settings.max_upload_bytes = v;
                }
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring unreadable server.toml");
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Some(v) = env("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(v) = env("APP__TOKEN_TTL_HOURS") {
        match v.trim().parse::<i64>() {
            Ok(hours) => {
                if let Some(seconds) = ttl_seconds_from_hours(hours) {
                    settings.token_ttl_seconds = seconds;
                }
            }
            Err(error) => tracing::warn!(%error, value = %v, "ignoring APP__TOKEN_TTL_HOURS"),
        }
    }

    if let Some(v) = env("APP__ALLOW_GUESTS") {
        settings.allow_guests = matches!(v.trim(), "1" | "true" | "yes" | "on");
    }

    if let Some(v) = env("APP__STATIC_DIR") {
        settings.static_dir = Some(PathBuf::from(v));
    }

    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.max_upload_bytes = parsed;
        }
    }

    settings
}

/// Non-positive lifetimes are ignored; longer ones are capped at
/// [`MAX_TOKEN_TTL_HOURS`].
fn ttl_seconds_from_hours(hours: i64) -> Option<i64> {
    if hours <= 0 {
        tracing::warn!(hours, "token ttl must be positive; keeping previous value");
        return None;
    }
    let capped = if hours > MAX_TOKEN_TTL_HOURS {
        tracing::warn!(hours, max = MAX_TOKEN_TTL_HOURS, "token ttl capped");
        MAX_TOKEN_TTL_HOURS
    } else {
        hours
    };
    capped.checked_mul(3600)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_windows_drive(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
#[path = "tests/config_tests.rs"]
mod tests;
