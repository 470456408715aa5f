//! Veil - a proxy server that looks like a web server
//!
//! Serves enveloped Connect, Forward and DNS requests, pairs LocalRP agents
//! with waiting clients, and answers everything else with a fallback page.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::ConfigArgs;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veil_server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(about = "Run the veil proxy server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    init_logging(log_level)?;

    let config = cli.config.resolve()?;
    info!(
        listen = %config.listen_addr(),
        tls = config.tls.is_some(),
        throttling = config.throttling,
        "🚀 Starting veil"
    );

    let server = ProxyServer::new(config).context("Failed to initialize server")?;

    tokio::select! {
        result = server.start() => {
            result.context("Server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
