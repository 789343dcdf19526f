use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::{domain::UserId, error::ApiException};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account that can log in with a password.
    CreateUser { username: String, password: String },
    /// List messages still waiting for delivery to a user.
    Pending { user_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username, password } => {
            let username = username.trim();
            if username.is_empty() || password.is_empty() {
                bail!("username and password must not be empty");
            }
            let hash = server_api::auth::hash_password(&password).map_err(ApiException::from)?;
            match storage.create_user(username, &hash).await? {
                Some(user_id) => println!("created user_id={user_id}"),
                None => bail!("username '{username}' already exists"),
            }
        }
        Command::Pending { user_id } => {
            let user_id = UserId(user_id);
            let Some(username) = storage.username_for_user(user_id).await? else {
                bail!("no user with id {user_id}");
            };
            let count = storage.count_undelivered(user_id).await?;
            println!("{count} pending message(s) for {username} (user_id={user_id})");
            let pending = storage.list_undelivered(user_id).await?;
            for message in pending {
                println!(
                    "{} {} from={} {}",
                    message.message_id,
                    message.kind.as_str(),
                    message.sender_id,
                    message.content
                );
            }
        }
    }

    Ok(())
}
