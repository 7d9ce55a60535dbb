use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnel_relay::{Config, RelayState};

#[derive(Parser, Debug)]
#[command(name = "tunnel-relay")]
#[command(about = "Rendezvous relay for tunnel peers")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "TUNNEL_RELAY_PORT")]
    port: Option<u16>,

    /// Milliseconds a fetch waits for pending material before answering 203
    #[arg(long)]
    fetch_wait_ms: Option<u64>,

    /// Seconds an untouched session is kept
    #[arg(long)]
    session_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ms) = cli.fetch_wait_ms {
        config.fetch_wait = Duration::from_millis(ms);
    }
    if let Some(secs) = cli.session_ttl_secs {
        config.session_ttl = Duration::from_secs(secs);
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        fetch_wait_ms = config.fetch_wait.as_millis() as u64,
        session_ttl_secs = config.session_ttl.as_secs(),
        "tunnel relay listening"
    );

    tunnel_relay::serve(listener, RelayState::new(config))
        .await
        .context("relay server failed")
}
