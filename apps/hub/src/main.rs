use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use websub_hub::config::{Config, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "websub-hub")]
#[command(about = "WebSub hub: verified subscriptions and signed content fan-out")]
struct Args {
    /// Overrides HUB_BIND_ADDR.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    init_tracing(config.log_format);
    websub_hub::serve(config).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
