use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use chat_client::{logging, ClientConfig};
use chat_proto::ids::{ConversationId, OutboxId};
use chat_proto::OutboxRecord;
use chat_store::{Inbox, Outbox, Store, Vault};

#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Inspect and manage the local chat outbox and inbox cache", long_about = None)]
struct Cli {
    /// Config file (defaults to <data_dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queued and failed outgoing messages
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },

    /// Local inbox cache
    Inbox {
        #[command(subcommand)]
        command: InboxCommand,
    },
}

#[derive(Subcommand)]
enum OutboxCommand {
    /// List outbox records
    List {
        /// Only this conversation (hex id)
        #[arg(long)]
        conv: Option<String>,
    },

    /// Remove a record, even if its send is in flight
    Cancel {
        /// Outbox id (hex)
        id: String,
    },

    /// Queue a failed record again
    Retry {
        /// Outbox id (hex)
        id: String,
    },

    /// Delete error records past their retention
    Purge,
}

#[derive(Subcommand)]
enum InboxCommand {
    /// Version, refetch flag and conversation count
    Status,
}

/// What `outbox list` shows. Message contents stay out of the output.
#[derive(Serialize)]
struct OutboxSummary {
    outbox_id: String,
    conv_id: String,
    ordinal: u64,
    state: &'static str,
    error_kind: Option<&'static str>,
    attempts: u32,
    ephemeral: bool,
    ctime: DateTime<Utc>,
}

impl From<&OutboxRecord> for OutboxSummary {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            outbox_id: record.outbox_id.to_hex(),
            conv_id: record.conv_id.to_hex(),
            ordinal: record.ordinal,
            state: record.state.as_str(),
            error_kind: record.error_kind().map(|k| k.as_str()),
            attempts: record.attempts(),
            ephemeral: record.is_ephemeral(),
            ctime: record.ctime,
        }
    }
}

async fn open_store(config: &ClientConfig) -> Result<Store> {
    let path = config.db_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(Store::open(&path, Vault::new()).await?)
}

async fn unlock(store: &Store) -> Result<()> {
    let password = rpassword::prompt_password("Vault password: ")?;
    store.unlock(password.as_bytes()).await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = ClientConfig::load_from(path)?;
            config.apply_overrides(|name| std::env::var(name).ok());
            config
        }
        None => ClientConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    let store = open_store(&config).await?;

    match cli.command {
        Commands::Outbox { command } => {
            unlock(&store).await?;
            let outbox = Outbox::new(store);
            match command {
                OutboxCommand::List { conv } => {
                    let conv = conv.as_deref().map(ConversationId::from_hex).transpose()?;
                    let records = outbox.list(conv.as_ref()).await?;
                    let summaries: Vec<OutboxSummary> = records.iter().map(OutboxSummary::from).collect();
                    print_json(&summaries)?;
                }
                OutboxCommand::Cancel { id } => {
                    let id = OutboxId::from_hex(&id)?;
                    let removed = outbox
                        .cancel(&id)
                        .await?
                        .ok_or_else(|| anyhow!("no outbox record {id}"))?;
                    print_json(&OutboxSummary::from(&removed))?;
                }
                OutboxCommand::Retry { id } => {
                    let id = OutboxId::from_hex(&id)?;
                    let record = outbox.retry(&id, None).await?;
                    print_json(&OutboxSummary::from(&record))?;
                }
                OutboxCommand::Purge => {
                    let purged = outbox
                        .purge(Utc::now(), config.error_purge_cutoff(), config.ephemeral_purge_cutoff())
                        .await?;
                    let summaries: Vec<OutboxSummary> = purged.iter().map(OutboxSummary::from).collect();
                    print_json(&serde_json::json!({ "purged_ephemeral": summaries }))?;
                }
            }
        }
        Commands::Inbox { command: InboxCommand::Status } => {
            let inbox = Inbox::new(store);
            print_json(&inbox.status().await?)?;
        }
    }

    Ok(())
}
