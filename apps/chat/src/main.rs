use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{guest_name, ChatClient, ClientEvent};
use shared::domain::{MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{format_inbound, parse_command, Command, HELP};

/// Most recent message bodies kept for `/reply` previews.
const RECENT_MESSAGES: usize = 256;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    #[arg(long, conflicts_with = "guest")]
    username: Option<String>,
    #[arg(long, requires = "username")]
    password: Option<String>,
    /// Create the account before logging in.
    #[arg(long, requires = "username")]
    register: bool,
    /// Connect under a generated guest name.
    #[arg(long)]
    guest: bool,
    /// Initial receiver.
    #[arg(long)]
    to: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let client = ChatClient::new(&args.server_url);
    let mut events = client.subscribe_events();

    if args.guest {
        let name = guest_name();
        let user_id = client.connect_as_guest(&name).await?;
        println!("connected as {name} (user {user_id})");
    } else {
        let username = args
            .username
            .as_deref()
            .context("either --username or --guest is required")?;
        let password = args
            .password
            .as_deref()
            .context("--password is required with --username")?;
        if args.register {
            client.register(username, password).await?;
            println!("registered {username}");
        }
        let user_id = client.login(username, password).await?;
        client.connect().await?;
        println!("connected as {username} (user {user_id})");
    }
    println!("{HELP}");

    let mut target = args.to.map(UserId);
    let mut recent = RecentMessages::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = run_command(&client, command, &mut target, &recent).await {
                            eprintln!("error: {err:#}");
                        }
                    }
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Message(inbound)) => {
                    recent.remember(inbound.message.id, &inbound.message.content);
                    println!("{}", format_inbound(&inbound, |url| client.resolve_url(url)));
                    if inbound.notify {
                        print!("\x07");
                        let _ = std::io::stdout().flush();
                    }
                }
                Ok(ClientEvent::ServerError(error)) => {
                    eprintln!("server rejected message: {}", error.message)
                }
                Ok(ClientEvent::Error(error)) => eprintln!("error: {error}"),
                Ok(ClientEvent::Connected { .. }) => {}
                Ok(ClientEvent::Disconnected) => {
                    eprintln!("disconnected from server");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run_command(
    client: &Arc<ChatClient>,
    command: Command,
    target: &mut Option<UserId>,
    recent: &RecentMessages,
) -> Result<()> {
    match command {
        Command::Send(text) => {
            client.send_text(*target, &text).await?;
        }
        Command::To(user_id) => {
            *target = Some(user_id);
            println!("now talking to user {user_id}");
        }
        Command::Reply(message_id) => {
            let content = recent
                .content(&message_id)
                .map(str::to_owned)
                .unwrap_or_else(|| message_id.to_string());
            let preview = client.set_reply(message_id, &content).await;
            println!("replying to: {preview}");
        }
        Command::Cancel => {
            client.cancel_reply().await;
            println!("reply cancelled");
        }
        Command::Upload(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let filename = attachment_name(&path);
            let mime_type = mime_guess::from_path(&path)
                .first_raw()
                .unwrap_or("application/octet-stream");
            let sent = client
                .upload_file(*target, &filename, mime_type, bytes)
                .await?;
            println!("sent {} {filename}", sent.kind.as_str());
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("attachment.bin")
        .to_string()
}

#[derive(Default)]
struct RecentMessages {
    order: VecDeque<MessageId>,
    contents: HashMap<MessageId, String>,
}

impl RecentMessages {
    fn remember(&mut self, id: MessageId, content: &str) {
        if self.contents.insert(id, content.to_string()).is_none() {
            self.order.push_back(id);
        }
        if self.order.len() > RECENT_MESSAGES {
            if let Some(evicted) = self.order.pop_front() {
                self.contents.remove(&evicted);
            }
        }
    }

    fn content(&self, id: &MessageId) -> Option<&str> {
        self.contents.get(id).map(String::as_str)
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
