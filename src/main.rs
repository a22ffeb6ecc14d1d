//! unique-keys-bot: Telegram bot that issues one unique key per user
//!
//! ## Usage
//!
//! ```bash
//! # Run the bot
//! KEYBOT_TOKEN=123:abc KEYBOT_DATABASE="Data Source=keys.db" unique-keys-bot
//!
//! # Print every issued key and exit
//! unique-keys-bot --database keys.db list
//! ```

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use unique_keys_bot::store::is_valid_key;
use unique_keys_bot::telegram::{BotClient, Poller};
use unique_keys_bot::{Config, KeyIssuanceStore, KeyIssuer};

#[derive(Parser)]
#[command(name = "unique-keys-bot")]
#[command(about = "Telegram bot that issues one unique key per user")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "unique-keys-bot.toml")]
    config: PathBuf,

    /// Bot API token (overrides config file)
    #[arg(long, env = "KEYBOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Storage connection string (overrides config file)
    #[arg(long, env = "KEYBOT_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print every issued key and exit
    List {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("unique_keys_bot=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(token) = cli.token {
        config.bot.token = token;
    }
    if let Some(database) = cli.database {
        config.storage.connection_string = database;
    }

    if let Some(Command::List { json }) = cli.command {
        let store = open_store(&config).await?;
        let mut records = pin!(store.list_all());
        while let Some(record) = records.next().await {
            let record = record?;
            if json {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!("UserId: {}, UniqueKey: {}", record.user_id, record.key);
            }
        }
        return Ok(());
    }

    config.validate()?;

    info!("Starting unique-keys-bot");
    let store = open_store(&config).await?;
    log_issued_keys(&store).await?;

    let client = Arc::new(BotClient::new(&config.bot)?);
    match client.get_me().await {
        Ok(me) => info!(bot_id = me.id, username = ?me.username, "Connected to Bot API"),
        Err(e) => warn!(error = %e, "Bot API check failed, polling anyway"),
    }

    let issuer = Arc::new(KeyIssuer::new(store));
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let poller = Poller::new(
        Arc::clone(&client),
        issuer,
        std::time::Duration::from_millis(config.bot.retry_delay_ms),
        shutdown_rx,
    );
    let mut poller_handle = tokio::spawn(poller.run());

    info!("Bot is running. Press Ctrl+C to stop.");

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut poller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Receive loop task failed");
            }
            false
        }
    };

    if interrupted {
        info!("Shutting down...");
        let _ = shutdown_tx.send(());
        if let Err(e) = poller_handle.await {
            error!(error = %e, "Receive loop task failed");
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<KeyIssuanceStore> {
    let location = config.storage.location()?;
    let store = KeyIssuanceStore::connect(location, config.storage.busy_timeout())
        .await?
        .with_timeout(config.storage.op_timeout());
    Ok(store)
}

/// Startup diagnostics: every key issued so far
async fn log_issued_keys(store: &KeyIssuanceStore) -> anyhow::Result<()> {
    let mut records = pin!(store.list_all());
    let mut total = 0u64;
    while let Some(record) = records.next().await {
        let record = record?;
        if !is_valid_key(&record.key) {
            warn!(user_id = record.user_id, "Stored key is not a UUID");
        }
        info!(user_id = record.user_id, key = %record.key, "Issued key");
        total += 1;
    }
    info!(total, "Loaded issuance records");
    Ok(())
}
