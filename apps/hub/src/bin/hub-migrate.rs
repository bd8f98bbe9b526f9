use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;
use websub_hub::db::{DEFAULT_DB_TIMEOUT_MS, HubDb};

#[derive(Parser, Debug)]
#[command(name = "hub-migrate")]
#[command(about = "Provision the websub hub subscription schema")]
struct Args {
    /// Falls back to DB_URL, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let database_url = args
        .database_url
        .or_else(|| std::env::var("DB_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("no database url: pass --database-url or set DB_URL"))?;

    let db = HubDb::connect(
        database_url.as_str(),
        Duration::from_millis(DEFAULT_DB_TIMEOUT_MS),
    )
        .await
        .context("connect to subscription database")?;
    db.ensure_schema()
        .await
        .context("provision hub_subscriptions schema")?;
    info!("hub_subscriptions schema is up to date");
    Ok(())
}
