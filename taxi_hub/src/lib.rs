//! Hub between taxis and clients.
//!
//! Taxis and clients connect over WebSocket to `/subscribe`, naming their
//! role as sub-protocol and their id and starting position in the query
//! string. Taxis push `pos#` updates; on a fixed period the hub sends every
//! client one `taxis-` batch holding the latest position of every taxi.

pub mod limit;
pub mod state;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use limit::ReadLimiter;
use state::{lock, Membership, SharedState};
use taxi_sim::{
    codec::SubscribeParams,
    transport::{Connection, Inbound},
    PositionMessage, Role,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_ADDR: &str = "127.0.0.1:4200";
pub const SUBSCRIBE_PATH: &str = "/subscribe";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Period between two feed broadcasts.
    pub broadcast_interval: Duration,
    /// Frames queued per connection; a client further behind is dropped.
    pub client_buffer: usize,
    /// Once a connection has used its burst, it is read at most once per
    /// period.
    pub read_period: Duration,
    pub read_burst: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_secs(2),
            client_buffer: 16,
            read_period: Duration::from_millis(100),
            read_burst: 10,
        }
    }
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("unknown path {0}")]
    UnknownPath(String),

    #[error("no supported sub-protocol offered")]
    MissingRole,

    #[error(transparent)]
    Query(#[from] taxi_sim::ProtocolError),
}

impl HandshakeError {
    fn into_response(self) -> ErrorResponse {
        let status = match self {
            HandshakeError::UnknownPath(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = status;
        response
    }
}

/// What a client asked for during the handshake.
struct Subscription {
    role: Role,
    protocol: String,
    params: SubscribeParams,
}

fn negotiate(request: &Request) -> Result<Subscription, HandshakeError> {
    let path = request.uri().path();
    if path != SUBSCRIBE_PATH {
        return Err(HandshakeError::UnknownPath(path.to_string()));
    }

    let (role, protocol) = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find_map(|tag| Role::from_tag(tag).map(|role| (role, tag.to_string())))
        .ok_or(HandshakeError::MissingRole)?;

    let params = SubscribeParams::from_query(request.uri().query().unwrap_or_default())?;
    Ok(Subscription {
        role,
        protocol,
        params,
    })
}

/// Accepts connections until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, config: HubConfig, shutdown: CancellationToken) -> Result<()> {
    let state = SharedState::default();
    info!(addr = %listener.local_addr()?, "hub listening");

    let broadcaster = tokio::spawn(broadcast_taxis(
        state.clone(),
        config.broadcast_interval,
        shutdown.clone(),
    ));

    loop {
        let (socket, addr) = select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        socket.set_nodelay(true)?;
        let state = state.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, addr, state, config, shutdown).await {
                warn!(%addr, error = %e, "connection failed");
            }
        });
    }

    broadcaster.await?;
    info!("hub stopped");
    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
    config: HubConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut subscription = None;
    let mut socket = accept_hdr_async(socket, |request: &Request, mut response: Response| {
        let accepted = negotiate(request).and_then(|sub| {
            let value = HeaderValue::from_str(&sub.protocol).map_err(|_| HandshakeError::MissingRole)?;
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            Ok(sub)
        });
        match accepted {
            Ok(sub) => {
                subscription = Some(sub);
                Ok(response)
            }
            Err(e) => {
                debug!(%addr, error = %e, "rejecting handshake");
                Err(e.into_response())
            }
        }
    })
    .await?;
    let Some(Subscription { role, params, .. }) = subscription else {
        bail!("handshake completed without a subscription");
    };

    let id = params.id.clone();
    let initial = PositionMessage::new(params.position, f64::from(params.heading));
    let admitted = lock(&state).admit(&id, role, initial);
    let generation = match admitted {
        Ok(generation) => generation,
        Err(e) => {
            warn!(%addr, error = %e, "refusing subscription");
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            socket.close(Some(frame)).await?;
            return Ok(());
        }
    };
    let membership = Membership::new(Arc::clone(&state), id, role, generation);
    info!(%addr, id = membership.id(), %role, "subscribed");

    let Connection { outgoing, incoming } = Connection::from_socket(socket, config.client_buffer);
    let limiter = ReadLimiter::new(config.read_period, config.read_burst);
    match role {
        Role::Producer => {
            // Held so the connection stays open; taxis are never written to.
            let _outgoing = outgoing;
            read_positions(&state, membership.id(), incoming, limiter, &shutdown).await;
        }
        Role::Consumer => {
            let attached = lock(&state).attach_client(membership.id(), generation, outgoing);
            if attached {
                wait_for_client_close(incoming, limiter, &shutdown).await;
            }
        }
    }

    info!(%addr, id = membership.id(), %role, "unsubscribed");
    Ok(())
}

/// Applies a taxi's position updates, reading at the limiter's pace.
async fn read_positions(
    state: &SharedState,
    id: &str,
    mut incoming: mpsc::Receiver<Inbound>,
    mut limiter: ReadLimiter,
    shutdown: &CancellationToken,
) {
    loop {
        let event = select! {
            _ = shutdown.cancelled() => return,
            event = async {
                limiter.acquire().await;
                incoming.recv().await
            } => event,
        };
        match event {
            Some(Inbound::Text(text)) => match text.parse::<PositionMessage>() {
                Ok(position) => {
                    debug!(%id, %position, "position");
                    lock(state).update_position(id, position);
                }
                Err(e) => warn!(%id, error = %e, "dropping malformed position"),
            },
            Some(Inbound::Closed(reason)) => {
                if !reason.is_clean() {
                    warn!(%id, ?reason, "taxi closed abnormally");
                }
                return;
            }
            None => return,
        }
    }
}

async fn wait_for_client_close(
    mut incoming: mpsc::Receiver<Inbound>,
    mut limiter: ReadLimiter,
    shutdown: &CancellationToken,
) {
    loop {
        select! {
            _ = shutdown.cancelled() => return,
            event = async {
                limiter.acquire().await;
                incoming.recv().await
            } => match event {
                Some(Inbound::Text(text)) => debug!(%text, "ignoring client message"),
                Some(Inbound::Closed(_)) | None => return,
            },
        }
    }
}

/// Sends the current positions to every client once per period. Nothing is
/// sent while there are no taxis, except one empty batch when the last taxi
/// leaves so clients clear their table.
async fn broadcast_taxis(state: SharedState, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut had_taxis = false;

    loop {
        select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut hub = lock(&state);
        let has_taxis = hub.taxi_count() > 0;
        if !has_taxis && !had_taxis {
            continue;
        }
        had_taxis = has_taxis;

        let batch = hub.snapshot();
        let delivered = hub.broadcast(&batch);
        debug!(taxis = batch.len(), clients = delivered, "broadcast");
    }
}

#[cfg(test)]
mod tests {
    use taxi_sim::GeoPoint;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn flooding_taxi_is_read_at_the_limited_pace() {
        let state = SharedState::default();
        let origin = PositionMessage::new(GeoPoint::new(-1.0, 0.0), 0.0);
        lock(&state).admit("cab", Role::Producer, origin).unwrap();

        let (tx, rx) = mpsc::channel(64);
        for i in 0..30 {
            let position = PositionMessage::new(GeoPoint::new(f64::from(i), 0.0), 0.0);
            tx.send(Inbound::Text(position.to_string())).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let limiter = ReadLimiter::new(Duration::from_millis(100), 10);
        let reader = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { read_positions(&state, "cab", rx, limiter, &shutdown).await })
        };
        let latitude = |state: &SharedState| lock(state).position("cab").unwrap().latitude;

        // The burst goes through at once, the rest waits.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(latitude(&state), 9.0);

        // Then one message per period.
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(latitude(&state), 19.0);

        shutdown.cancel();
        reader.await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn malformed_positions_are_skipped() {
        let state = SharedState::default();
        let origin = PositionMessage::new(GeoPoint::new(1.0, 2.0), 0.0);
        lock(&state).admit("cab", Role::Producer, origin).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(Inbound::Text("pos#oops".into())).await.unwrap();
        tx.send(Inbound::Text("pos#3,4,90".into())).await.unwrap();
        tx.send(Inbound::Closed(taxi_sim::transport::CloseReason::Normal))
            .await
            .unwrap();

        let limiter = ReadLimiter::new(Duration::ZERO, 1);
        read_positions(&state, "cab", rx, limiter, &CancellationToken::new()).await;
        let position = lock(&state).position("cab").unwrap();
        assert_eq!((position.latitude, position.longitude), (3.0, 4.0));
    }
}
