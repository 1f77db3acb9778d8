use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use dns_config::ConfigParser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dns-flatten-proxy", about, long_about = None)]
struct Cli {
    /// Path to the main `resolved.conf`-style config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of `*.conf` drop-ins merged on top of `--config`.
    #[arg(long)]
    drop_in_dir: Option<PathBuf>,

    /// `/etc/resolv.conf`-style file consulted when no `DNS=` is configured.
    #[arg(long)]
    resolv_conf: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let defaults = ConfigParser::default();

    let config = ConfigParser {
        config_path: cli.config.unwrap_or(defaults.config_path),
        drop_in_dir: cli.drop_in_dir.unwrap_or(defaults.drop_in_dir),
        resolv_conf_path: cli.resolv_conf.unwrap_or(defaults.resolv_conf_path),
        ..defaults
    }
    .resolve()
    .context("Failed to resolve configuration")?;

    if let Some(warning) = &config.warning {
        tracing::warn!("{warning}");
    }

    tracing::info!(
        dns = ?config.dns,
        fallback_dns = ?config.fallback_dns,
        cache = config.cache,
        bind_address = %config.bind_address,
        "Starting DNS proxy"
    );

    dns_proxy_core::run(config)
        .await
        .context("DNS proxy terminated")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}
