mod app;
mod auth;
mod config;
mod http;
mod modem;
mod queue;
mod sms;

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use crate::app::AppHandles;
use crate::auth::ApiKeyManager;
use crate::config::AppConfig;
use crate::sms::database::SMSDatabase;

#[derive(Parser)]
#[command(name = "sms-gateway")]
#[command(about = "An SMS gateway that queues and delivers messages through a HiLink USB modem.")]
struct CliArguments {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the gateway (default when no subcommand is given).
    Serve,

    /// Create an API key. The secret is printed once and never stored.
    CreateKey {
        #[arg(long)]
        name: String,

        /// Hourly quota override for this key.
        #[arg(long)]
        rate_limit: Option<i64>
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = CliArguments::parse();
    let config = AppConfig::load(args.config)?;

    match args.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => {
            let handles = AppHandles::create(config).await?;
            handles.run().await;
        },
        CliCommand::CreateKey { name, rate_limit } => {
            let database = Arc::new(SMSDatabase::connect(&config.database).await?);
            let (manager, _usage_worker) = ApiKeyManager::new(database, config.auth.default_rate_limit);

            let (key, secret) = manager.create_key(&name, rate_limit).await?;
            println!("Created API key '{}' ({})", key.name, key.api_key_id);
            println!("Prefix: {}", key.key_prefix);
            println!("Secret (shown once, store it now): {}", secret);
        }
    }

    Ok(())
}
