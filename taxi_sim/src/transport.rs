//! Message-oriented connections.
//!
//! A [`Connection`] is a pair of queues: [`Outgoing`] frames go to the peer,
//! [`Inbound`] events come back, ending with exactly one
//! [`Inbound::Closed`]. The WebSocket pump bridges a socket onto these
//! queues so sessions never touch the socket directly.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tokio_tungstenite::{
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, trace};

use crate::codec::{Role, SubscribeParams};

/// How long to wait for the peer to acknowledge a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("connection is closed")]
    Closed,

    #[error("outgoing queue is full")]
    Full,

    #[error("connection closed abnormally: {0}")]
    Abnormal(String),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    GoingAway,
    Abnormal(String),
}

impl CloseReason {
    /// Normal closure and going-away are the only clean endings.
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Normal | CloseReason::GoingAway)
    }

    pub fn into_result(self) -> Result<(), TransportError> {
        match self {
            CloseReason::Abnormal(reason) => Err(TransportError::Abnormal(reason)),
            _ => Ok(()),
        }
    }

    fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        let Some(frame) = frame else {
            return CloseReason::Normal;
        };
        match frame.code {
            CloseCode::Normal => CloseReason::Normal,
            CloseCode::Away => CloseReason::GoingAway,
            code => CloseReason::Abnormal(format!("{} {}", u16::from(code), frame.reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Sending half of a connection.
#[derive(Debug, Clone)]
pub struct Outgoing {
    sender: mpsc::Sender<Outbound>,
    abort: Arc<watch::Sender<Option<String>>>,
}

impl Outgoing {
    /// True once the transport behind this connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.sender
            .send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Queues a frame without waiting. Fails with [`TransportError::Full`]
    /// when the peer is not keeping up.
    pub fn try_send_text(&self, text: String) -> Result<(), TransportError> {
        self.sender
            .try_send(Outbound::Text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Full,
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Requests a normal close. A no-op if already closed.
    pub async fn close(&self) {
        let _ = self.sender.send(Outbound::Close).await;
    }

    /// Closes with a policy violation, skipping anything still queued. Works
    /// when the queue is full.
    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.send_replace(Some(reason.into()));
    }
}

pub struct Connection {
    pub outgoing: Outgoing,
    pub incoming: mpsc::Receiver<Inbound>,
}

/// The far side of an in-memory connection.
pub struct RemoteEnd {
    pub sent: mpsc::Receiver<Outbound>,
    pub deliver: mpsc::Sender<Inbound>,
    /// Set once [`Outgoing::abort`] is called.
    pub aborted: watch::Receiver<Option<String>>,
}

impl Connection {
    /// A connection whose peer is plain queues, for tests and for embedding
    /// the session logic behind another transport.
    pub fn in_memory(buffer: usize) -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (abort_tx, abort_rx) = watch::channel(None);
        let connection = Connection {
            outgoing: Outgoing {
                sender: out_tx,
                abort: Arc::new(abort_tx),
            },
            incoming: in_rx,
        };
        let remote = RemoteEnd {
            sent: out_rx,
            deliver: in_tx,
            aborted: abort_rx,
        };
        (connection, remote)
    }

    /// Spawns a task pumping frames between `socket` and the returned
    /// connection. The task exits, closing the outgoing side, once either end
    /// closes.
    pub fn from_socket<S>(socket: WebSocketStream<S>, buffer: usize) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, remote) = Connection::in_memory(buffer);
        tokio::spawn(pump(socket, remote));
        connection
    }
}

async fn pump<S>(socket: WebSocketStream<S>, remote: RemoteEnd)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let RemoteEnd {
        sent: mut outbound,
        deliver,
        mut aborted,
    } = remote;
    let (mut sink, mut stream) = socket.split();
    let mut abortable = true;

    let reason = loop {
        select! {
            biased;
            changed = aborted.changed(), if abortable => {
                let reason = aborted.borrow_and_update().clone();
                match (changed, reason) {
                    (_, Some(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::Policy,
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break CloseReason::Abnormal(format!("{} {reason}", u16::from(CloseCode::Policy)));
                    }
                    // Every sender is gone without aborting.
                    (Err(_), None) => abortable = false,
                    (Ok(()), None) => {}
                }
            }
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    trace!(%text, "-->");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break CloseReason::Abnormal(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break CloseReason::Normal;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    trace!(%text, "<--");
                    if deliver.send(Inbound::Text(text)).await.is_err() {
                        // Nobody is listening any more; treat as a local close.
                        let _ = sink.send(Message::Close(None)).await;
                        break CloseReason::Normal;
                    }
                }
                Some(Ok(Message::Close(frame))) => break CloseReason::from_frame(frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Abnormal(e.to_string()),
                None => break CloseReason::Abnormal("stream ended without a close frame".into()),
            },
        }
    };

    // Keep reading so the close handshake gets flushed and acknowledged.
    let drain = async { while let Some(Ok(_)) = stream.next().await {} };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, drain).await;

    debug!(?reason, "connection closed");
    let _ = deliver.send(Inbound::Closed(reason)).await;
}

/// Everything needed to open one session's connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub role: Role,
    pub params: SubscribeParams,
}

/// Opens connections for sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, TransportError>;
}

/// Connects to a hub over WebSocket, offering the role as sub-protocol.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: String,
    buffer: usize,
}

impl WsConnector {
    /// `base` is the hub's `ws://host:port` address.
    pub fn new(base: impl Into<String>, buffer: usize) -> Self {
        Self {
            base: base.into(),
            buffer,
        }
    }

    pub fn endpoint(&self, params: &SubscribeParams) -> String {
        format!(
            "{}/subscribe?{}",
            self.base.trim_end_matches('/'),
            params.to_query()
        )
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, TransportError> {
        let url = self.endpoint(&request.params);
        let connect_error = |source| TransportError::Connect {
            url: url.clone(),
            source,
        };

        let mut ws_request = url.as_str().into_client_request().map_err(connect_error)?;
        ws_request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(request.role.protocol()),
        );

        let (socket, _) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(connect_error)?;
        debug!(%url, role = %request.role, "connected");
        Ok(Connection::from_socket(socket, self.buffer))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::from_frame(None), CloseReason::Normal);
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        };
        assert!(CloseReason::from_frame(Some(away)).is_clean());
        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: "slow".into(),
        };
        let reason = CloseReason::from_frame(Some(policy));
        assert_eq!(reason, CloseReason::Abnormal("1008 slow".into()));
        assert!(reason.into_result().is_err());
    }

    #[test]
    fn endpoint_carries_session_parameters() {
        let connector = WsConnector::new("ws://127.0.0.1:4200/", 16);
        let params = SubscribeParams {
            id: "cab".into(),
            position: GeoPoint::new(1.5, -2.0),
            heading: 0,
        };
        assert_eq!(
            connector.endpoint(&params),
            "ws://127.0.0.1:4200/subscribe?id=cab&lat=1.5&lon=-2&head=0"
        );
    }

    #[tokio::test]
    async fn abort_closes_with_policy_violation() {
        use tungstenite::protocol::Role as WsRole;

        let (server_io, client_io) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(server_io, WsRole::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, WsRole::Client, None).await;
        let Connection {
            outgoing,
            mut incoming,
        } = Connection::from_socket(server, 1);

        outgoing.abort("slow subscriber");
        // Queued behind the abort, never sent.
        let _ = outgoing.try_send_text("late".into());

        let frame = loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(other)) => panic!("unexpected frame {other:?}"),
                other => panic!("stream ended early: {other:?}"),
            }
        };
        let frame = frame.unwrap();
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason, "slow subscriber");
        while let Some(Ok(_)) = client.next().await {}

        assert_eq!(
            incoming.recv().await,
            Some(Inbound::Closed(CloseReason::Abnormal("1008 slow subscriber".into())))
        );
    }

    #[tokio::test]
    async fn in_memory_abort_is_visible_to_the_remote() {
        let (connection, remote) = Connection::in_memory(1);
        assert_eq!(*remote.aborted.borrow(), None);
        connection.outgoing.abort("slow subscriber");
        assert_eq!(remote.aborted.borrow().as_deref(), Some("slow subscriber"));
    }

    #[tokio::test]
    async fn outgoing_reports_closed_once_remote_is_gone() {
        let (connection, remote) = Connection::in_memory(1);
        assert!(!connection.outgoing.is_closed());
        connection.outgoing.try_send_text("a".into()).unwrap();
        assert!(matches!(
            connection.outgoing.try_send_text("b".into()),
            Err(TransportError::Full)
        ));
        drop(remote);
        assert!(connection.outgoing.is_closed());
        assert!(connection.outgoing.send_text("c".into()).await.is_err());
    }
}
