//! `vaultsyncd` — the vault synchronization server.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vaultsync::config::Config;
use vaultsync::server;

#[derive(Debug, Parser)]
#[command(name = "vaultsyncd", about = "Real-time multi-device vault sync server")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    if config.auth.master_token.is_empty() {
        bail!("master token is required (auth.master_token or VAULT_SYNC_TOKEN)");
    }
    if config.server.tls.enabled
        && (config.server.tls.cert.is_empty() || config.server.tls.key.is_empty())
    {
        bail!("TLS is enabled but cert/key paths are missing");
    }

    tracing::info!(
        port = config.server.port,
        storage = %config.storage.path.display(),
        tls = config.server.tls.enabled,
        "starting vaultsyncd"
    );

    server::run_server(config).await
}
