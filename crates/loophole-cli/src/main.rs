//! Loophole CLI - expose a local HTTP server to the public internet

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loophole_auth::TokenStore;
use loophole_tunnel::config::{DEFAULT_GATEWAY_HOST, DEFAULT_GATEWAY_PORT};
use loophole_tunnel::{Supervisor, TunnelConfig};

/// Expose local servers to the public internet through TLS tunnels
#[derive(Parser, Debug)]
#[command(name = "loophole")]
#[command(about = "Expose local servers to the public internet through TLS tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Local port to expose
    #[arg(value_name = "port")]
    port: Option<u16>,

    /// Local host to expose
    #[arg(value_name = "host", default_value = "127.0.0.1")]
    host: String,

    /// Private key used to authenticate against the gateway
    #[arg(short = 'i', long = "identity-file", value_name = "path")]
    identity_file: Option<PathBuf>,

    /// SSH gateway host
    #[arg(long, value_name = "host", default_value = DEFAULT_GATEWAY_HOST)]
    gateway_url: String,

    /// SSH gateway port
    #[arg(long, value_name = "int", default_value_t = DEFAULT_GATEWAY_PORT)]
    gateway_port: u16,

    /// Request a specific site identifier instead of a generated one
    #[arg(long, value_name = "site")]
    hostname: Option<String>,

    /// Render a QR code of the public URL once the tunnel is up
    #[arg(long)]
    qr: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and store API credentials
    Login,
    /// Remove stored API credentials
    Logout,
}

#[tokio::main]
async fn main() {
    // Argument errors are fatal like everything else: exit code 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Login) => {
            let store = TokenStore::new()?;
            loophole_auth::device::login(&store).await?;
            println!("Logged in successfully");
            Ok(())
        }
        Some(Commands::Logout) => {
            let store = TokenStore::new()?;
            store.delete()?;
            println!("Logged out");
            Ok(())
        }
        None => {
            let port = cli
                .port
                .context("a local port to expose is required (e.g. `loophole 3000`)")?;
            let identity_file = match cli.identity_file {
                Some(path) => path,
                None => dirs::home_dir()
                    .context("cannot determine home directory")?
                    .join(".ssh")
                    .join("id_rsa"),
            };

            let config = TunnelConfig::new(port, cli.host, identity_file)
                .with_gateway(cli.gateway_url, cli.gateway_port)
                .with_requested_hostname(cli.hostname)
                .with_qr(cli.qr);

            Supervisor::new(config)?.run().await?;
            Ok(())
        }
    }
}
