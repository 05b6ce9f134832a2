use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use taxi_sim::{
    config::DEFAULT_SERVER,
    feed,
    polyline::{self, DEFAULT_PRECISION},
    route_lookup::{fetch_route, HttpRouteLookup},
    ConnectionManager, GeoPoint, Route, Session, SessionStatus, SimConfig, WsConnector,
};
use tokio::{select, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Streams simulated taxi positions to a hub, or watches the live feed")]
struct Cli {
    /// Hub address.
    #[arg(long, env = "TAXI_HUB", default_value = DEFAULT_SERVER)]
    server: String,

    /// Milliseconds between two positions of one taxi.
    #[arg(long, default_value_t = 1700)]
    tick_ms: u64,

    /// Polyline precision (decimal places).
    #[arg(long, default_value_t = DEFAULT_PRECISION)]
    precision: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive taxis along a route.
    Taxi {
        #[arg(long, required_unless_present = "polyline")]
        from: Option<String>,
        #[arg(long, required_unless_present = "polyline")]
        to: Option<String>,
        /// Use this encoded route instead of asking the route service.
        #[arg(long, conflicts_with_all = ["from", "to"])]
        polyline: Option<String>,
        /// Base URL of the route service answering `GET /route?from=..&to=..`.
        #[arg(long, env = "TAXI_ROUTE_SERVICE", required_unless_present = "polyline")]
        route_service: Option<String>,
        /// Session id; generated when omitted. Suffixed with `-<n>` when
        /// several taxis are started.
        #[arg(long)]
        id: Option<String>,
        /// Number of taxis to run on the route.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Watch the aggregated feed.
    Client {
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        lon: f64,
    },
}

impl Cli {
    fn config(&self) -> SimConfig {
        SimConfig {
            server: self.server.clone(),
            route_service: match &self.command {
                Command::Taxi { route_service, .. } => route_service.clone(),
                Command::Client { .. } => None,
            },
            tick_interval: Duration::from_millis(self.tick_ms),
            precision: self.precision,
            ..SimConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let manager = ConnectionManager::new(
        WsConnector::new(config.server.clone(), config.channel_buffer),
        config.tick_interval,
    );

    match cli.command {
        Command::Taxi {
            from,
            to,
            polyline,
            id,
            count,
            ..
        } => {
            let route = match polyline {
                Some(encoded) => polyline::decode(&encoded, config.precision)?,
                None => {
                    let (from, to) = (from.unwrap_or_default(), to.unwrap_or_default());
                    let base = config
                        .route_service
                        .clone()
                        .context("--route-service is required without --polyline")?;
                    let lookup = HttpRouteLookup::new(base);
                    fetch_route(&lookup, &from, &to, config.precision)
                        .await
                        .with_context(|| format!("no usable route from {from} to {to}"))?
                }
            };
            run_taxis(&manager, route, id, count).await
        }
        Command::Client { id, lat, lon } => {
            watch_feed(&manager, id, GeoPoint::new(lat, lon)).await
        }
    }
}

async fn run_taxis(
    manager: &ConnectionManager<WsConnector>,
    route: Route,
    id: Option<String>,
    count: usize,
) -> Result<()> {
    info!(points = route.len(), count, "starting taxis");
    let mut sessions = Vec::with_capacity(count);
    for n in 0..count {
        let id = match (&id, count) {
            (Some(id), 1) => Some(id.clone()),
            (Some(id), _) => Some(format!("{id}-{n}")),
            (None, _) => None,
        };
        sessions.push(manager.open_producer(id, route.clone()).await?);
    }

    select! {
        _ = signal::ctrl_c() => {
            info!("interrupted, closing taxis");
            for session in &sessions {
                session.close();
            }
        }
        _ = all_closed(&sessions) => {}
    }

    for session in sessions {
        let id = session.id().to_string();
        let outcome = session.join().await?;
        info!(%id, ?outcome, "taxi done");
    }
    Ok(())
}

async fn all_closed(sessions: &[Session]) {
    join_all(sessions.iter().map(|session| {
        let mut status = session.status_changes();
        async move {
            let _ = status.wait_for(|s| *s == SessionStatus::Closed).await;
        }
    }))
    .await;
}

async fn watch_feed(
    manager: &ConnectionManager<WsConnector>,
    id: Option<String>,
    origin: GeoPoint,
) -> Result<()> {
    let session = manager.open_consumer(id, origin).await?;
    let mut updates = session.feed().context("client session has no feed")?;
    info!(id = session.id(), "watching feed");

    loop {
        select! {
            _ = signal::ctrl_c() => {
                session.close();
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let batch = updates.borrow_and_update().clone();
                println!("{:<6} {:<36} {:>11} {:>11}", "type", "id", "latitude", "longitude");
                for row in feed::rows(&batch) {
                    println!("{row}");
                }
                println!();
            }
        }
    }

    let outcome = session.join().await?;
    info!(?outcome, "client done");
    Ok(())
}
