// Vault upload client.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vault_client::Driver;

/// Upload files to a vault server, encrypted end to end.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Files to upload, one after another.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Server address (host:port). Overrides config and VAULT_SERVER.
    #[clap(short, long)]
    server: Option<String>,

    /// Name to register or reconnect as. Overrides config and VAULT_NAME.
    #[clap(short, long)]
    name: Option<String>,

    /// Config file (default ~/.config/vault/client.toml).
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Identity file holding the peer ID and private key.
    #[clap(long)]
    identity: Option<PathBuf>,

    /// Largest ciphertext slice per packet, in bytes.
    #[clap(long)]
    max_packet_size: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,vault_client=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = vault_client::config::load(args.config.as_deref()).context("loading config")?;
    if let Some(server) = args.server {
        cfg.server = server;
    }
    if let Some(name) = args.name {
        cfg.name = Some(name);
    }
    if let Some(path) = args.identity {
        cfg.identity_path = Some(path);
    }
    if let Some(size) = args.max_packet_size {
        cfg.max_packet_size = size;
    }
    let name = cfg
        .name
        .clone()
        .context("no name given (use --name, VAULT_NAME or the config file)")?;
    let server = cfg.server.clone();

    let driver = Driver::new(cfg);
    for file in &args.files {
        let report = driver
            .submit(file, &server, &name)
            .await
            .with_context(|| format!("uploading {}", file.display()))?;
        println!(
            "{}: {} bytes in {} packet(s), checksum {:08x}, attempts {}",
            report.filename, report.bytes, report.packets, report.checksum, report.attempts
        );
    }
    Ok(())
}
