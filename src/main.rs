//! ledgerd CLI Entry Point
//!
//! Starts one cluster node and serves until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerd::{ClusterConfig, Node};

/// ledgerd - replicated payment-transaction service
#[derive(Parser)]
#[command(name = "ledgerd")]
#[command(version)]
#[command(about = "Replicated payment-transaction service node", long_about = None)]
struct Args {
    /// Node id to run, as named in the cluster config
    #[arg(short, long)]
    node: String,

    /// Path to the cluster TOML config; defaults plus env overrides if omitted
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ledgerd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::from_env(),
    };

    tracing::info!("starting ledgerd node {}", args.node);
    let node = Node::new(args.node, config)?;
    let addr = node.start().await?;
    tracing::info!("node serving on {addr}");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    node.stop().await;
    Ok(())
}
