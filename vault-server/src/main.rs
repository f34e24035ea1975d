// Vault storage daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Vault storage daemon: accepts encrypted file uploads over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (default ~/.config/vault/server.toml, then /etc/vault/server.toml).
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,vault_server=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = vault_server::config::load(args.config.as_deref()).context("loading config")?;
    tracing::info!(
        event = "config_loaded",
        bind = %cfg.bind,
        storage = %cfg.storage_dir.display(),
        max_packet_size = cfg.max_packet_size
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let handle = vault_server::start(cfg).await.context("starting server")?;
        shutdown_signal().await?;
        tracing::info!(event = "shutdown_requested");
        handle.stop().await;
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
