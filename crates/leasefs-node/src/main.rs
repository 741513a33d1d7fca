use anyhow::{Context, Result};
use clap::Parser;
use leasefs_node::cli::Cli;
use leasefs_node::{Node, NodeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = cli.load_config().context("failed to load configuration")?;
    init_tracing(&config);
    config.validate().context("invalid configuration")?;

    tracing::info!(identity = %config.node.identity, "LeaseFS node starting...");
    let node = Node::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    node.shutdown().await
}

fn init_tracing(config: &NodeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.node.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
