use std::path::PathBuf;

use client_core::{InboundMessage, MessageBody};
use shared::domain::{MessageId, UserId};

pub const HELP: &str = "\
commands:
  <text>               send text to the current receiver
  /to <user-id>        choose the receiver
  /reply <message-id>  quote a message in the next send
  /cancel              drop the pending reply
  /upload <path>       send an image or audio file
  /help                show this help
  /quit                leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    To(UserId),
    Reply(MessageId),
    Cancel,
    Upload(PathBuf),
    Help,
    Quit,
}

/// Parses one stdin line. Blank lines yield `Ok(None)`; the error is a usage
/// hint for the user.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "to" => {
            let id = arg
                .parse::<i64>()
                .map_err(|_| "usage: /to <user-id>".to_string())?;
            Command::To(UserId(id))
        }
        "reply" => {
            let id = arg
                .parse::<MessageId>()
                .map_err(|_| "usage: /reply <message-id>".to_string())?;
            Command::Reply(id)
        }
        "upload" if !arg.is_empty() => Command::Upload(PathBuf::from(arg)),
        "upload" => return Err("usage: /upload <path>".to_string()),
        "cancel" => Command::Cancel,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

/// One line per message: time, author, optional quote, body and the id to
/// use with `/reply`.
pub fn format_inbound(inbound: &InboundMessage, resolve_url: impl Fn(&str) -> String) -> String {
    let message = &inbound.message;
    let author = if inbound.mine {
        "you".to_string()
    } else {
        format!("user {}", message.sender_id)
    };
    let quote = inbound
        .quote
        .as_deref()
        .map(|quote| format!(" (re {quote})"))
        .unwrap_or_default();
    let body = match &inbound.body {
        MessageBody::Text(text) => text.clone(),
        MessageBody::Image(url) => format!("[image] {}", resolve_url(url)),
        MessageBody::Audio(url) => format!("[audio] {}", resolve_url(url)),
    };
    format!(
        "[{}] {author}{quote}: {body}  #{}",
        message.created_at.format("%H:%M"),
        message.id
    )
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
