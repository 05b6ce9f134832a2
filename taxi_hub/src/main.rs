use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use taxi_hub::{serve, HubConfig, DEFAULT_ADDR};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Relays taxi positions to feed clients")]
struct Args {
    /// Address to listen on.
    #[arg(default_value = DEFAULT_ADDR)]
    addr: String,

    /// Milliseconds between two feed broadcasts.
    #[arg(long, default_value_t = 2000)]
    broadcast_ms: u64,

    /// Frames queued per client before it is dropped as too slow.
    #[arg(long, default_value_t = 16)]
    buffer: usize,

    /// Milliseconds between two reads from one connection once its burst is
    /// used up.
    #[arg(long, default_value_t = 100)]
    read_ms: u64,

    /// Messages read back to back from one connection.
    #[arg(long, default_value_t = 10)]
    read_burst: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = HubConfig {
        broadcast_interval: Duration::from_millis(args.broadcast_ms),
        client_buffer: args.buffer,
        read_period: Duration::from_millis(args.read_ms),
        read_burst: args.read_burst,
    };

    let listener = TcpListener::bind(&args.addr).await?;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("terminating");
            token.cancel();
        }
    });

    serve(listener, config, shutdown).await
}
