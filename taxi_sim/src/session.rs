//! Connection role manager.
//!
//! Opens one connection per participant, tags it with its [`Role`] and keeps
//! the process-wide [`SessionRegistry`]. The registry admits any number of
//! taxi sessions but at most one client session, and that is checked before
//! any connection attempt is made.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    codec::{validate_id, FeedBatch, ProtocolError, Role, SubscribeParams},
    feed::FeedAggregator,
    geo::{GeoPoint, Route},
    streamer::{run_streamer, EmptyRoute, PositionStreamer, StreamOutcome},
    transport::{CloseReason, ConnectRequest, Connection, Connector, Inbound, TransportError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a {role} session is already open")]
    DuplicateRole { role: Role },

    #[error("session {0} is already open")]
    DuplicateId(String),

    #[error("invalid session id: {0}")]
    InvalidId(#[source] ProtocolError),

    #[error(transparent)]
    EmptyRoute(#[from] EmptyRoute),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A taxi reached the end of its route.
    Finished { sent: usize },
    /// Closed from this side with [`Session::close`].
    ClosedLocally,
    /// The peer or the transport ended the connection.
    ClosedRemotely(CloseReason),
}

/// Sessions currently open in this process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Role>,
    consumer: Option<String>,
}

impl SessionRegistry {
    pub fn register(&mut self, id: &str, role: Role) -> Result<(), SessionError> {
        if role == Role::Consumer && self.consumer.is_some() {
            return Err(SessionError::DuplicateRole { role });
        }
        if self.sessions.contains_key(id) {
            return Err(SessionError::DuplicateId(id.to_string()));
        }
        self.sessions.insert(id.to_string(), role);
        if role == Role::Consumer {
            self.consumer = Some(id.to_string());
        }
        Ok(())
    }

    pub fn deregister(&mut self, id: &str) -> Option<Role> {
        if self.consumer.as_deref() == Some(id) {
            self.consumer = None;
        }
        self.sessions.remove(id)
    }

    pub fn role(&self, id: &str) -> Option<Role> {
        self.sessions.get(id).copied()
    }

    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// `(id, role)` pairs sorted by id.
    pub fn sessions(&self) -> Vec<(String, Role)> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|(id, role)| (id.clone(), *role))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }
}

type SharedRegistry = Arc<Mutex<SessionRegistry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, SessionRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registry entry that removes itself when dropped.
struct Registration {
    registry: SharedRegistry,
    id: String,
}

impl Registration {
    fn acquire(registry: &SharedRegistry, id: &str, role: Role) -> Result<Self, SessionError> {
        lock(registry).register(id, role)?;
        Ok(Self {
            registry: registry.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.registry).deregister(&self.id);
    }
}

/// Fresh session id for callers that do not supply one.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Handle to an open session.
#[derive(Debug)]
pub struct Session {
    id: String,
    role: Role,
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    feed: Option<watch::Receiver<FeedBatch>>,
    task: JoinHandle<SessionOutcome>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watches the status; it changes exactly once, to `Closed`.
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest feed batch, for client sessions.
    pub fn feed(&self) -> Option<watch::Receiver<FeedBatch>> {
        self.feed.clone()
    }

    /// Asks the session to close. Pending ticks are cancelled and the
    /// connection is closed normally.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session to end. By the time this returns the session
    /// has been deregistered and its status is `Closed`.
    pub async fn join(self) -> Result<SessionOutcome, SessionError> {
        Ok(self.task.await?)
    }
}

/// Opens and tracks sessions against one hub.
pub struct ConnectionManager<C> {
    connector: Arc<C>,
    registry: SharedRegistry,
    tick_interval: Duration,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, tick_interval: Duration) -> Self {
        Self {
            connector: Arc::new(connector),
            registry: SharedRegistry::default(),
            tick_interval,
        }
    }

    /// Open sessions as `(id, role)` pairs.
    pub fn active(&self) -> Vec<(String, Role)> {
        lock(&self.registry).sessions()
    }

    pub fn has_consumer(&self) -> bool {
        lock(&self.registry).consumer().is_some()
    }

    /// Opens a taxi session that streams `route` and then closes.
    pub async fn open_producer(
        &self,
        id: Option<String>,
        route: Route,
    ) -> Result<Session, SessionError> {
        let id = checked_id(id)?;
        let streamer = PositionStreamer::new(route)?;
        let start = streamer.route().first().ok_or(EmptyRoute)?;

        let registration = Registration::acquire(&self.registry, &id, Role::Producer)?;
        let connection = self.connect(&id, Role::Producer, start).await?;

        let (status_tx, status) = watch::channel(SessionStatus::Open);
        let cancel = CancellationToken::new();
        info!(%id, points = streamer.route().len(), "taxi session open");
        let task = tokio::spawn(drive_producer(
            streamer,
            connection,
            self.tick_interval,
            cancel.clone(),
            status_tx,
            registration,
        ));

        Ok(Session {
            id,
            role: Role::Producer,
            cancel,
            status,
            feed: None,
            task,
        })
    }

    /// Opens the client session. Fails with
    /// [`SessionError::DuplicateRole`] while another one is open.
    pub async fn open_consumer(
        &self,
        id: Option<String>,
        origin: GeoPoint,
    ) -> Result<Session, SessionError> {
        let id = checked_id(id)?;
        let registration = Registration::acquire(&self.registry, &id, Role::Consumer)?;
        let connection = self.connect(&id, Role::Consumer, origin).await?;

        let aggregator = FeedAggregator::new();
        let feed = aggregator.subscribe();
        let (status_tx, status) = watch::channel(SessionStatus::Open);
        let cancel = CancellationToken::new();
        info!(%id, "client session open");
        let task = tokio::spawn(drive_consumer(
            aggregator,
            connection,
            cancel.clone(),
            status_tx,
            registration,
        ));

        Ok(Session {
            id,
            role: Role::Consumer,
            cancel,
            status,
            feed: Some(feed),
            task,
        })
    }

    async fn connect(
        &self,
        id: &str,
        role: Role,
        position: GeoPoint,
    ) -> Result<Connection, SessionError> {
        let request = ConnectRequest {
            role,
            params: SubscribeParams {
                id: id.to_string(),
                position,
                heading: 0,
            },
        };
        self.connector.connect(&request).await.map_err(|e| {
            warn!(%id, %role, error = %e, "connect failed");
            SessionError::Transport(e)
        })
    }
}

fn checked_id(id: Option<String>) -> Result<String, SessionError> {
    let id = id.unwrap_or_else(generate_id);
    validate_id(&id).map_err(SessionError::InvalidId)?;
    Ok(id)
}

/// How long a closing session waits for the transport to flush and confirm.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Waits for the connection to end. Taxis ignore anything sent to them.
async fn wait_for_close(incoming: &mut mpsc::Receiver<Inbound>) -> CloseReason {
    loop {
        match incoming.recv().await {
            Some(Inbound::Text(text)) => trace!(%text, "ignoring inbound text"),
            Some(Inbound::Closed(reason)) => return reason,
            None => return CloseReason::Abnormal("transport dropped".into()),
        }
    }
}

/// Close reason already queued by the transport, if any.
fn pending_close(incoming: &mut mpsc::Receiver<Inbound>) -> CloseReason {
    while let Ok(event) = incoming.try_recv() {
        if let Inbound::Closed(reason) = event {
            return reason;
        }
    }
    CloseReason::Abnormal("connection lost".into())
}

/// Waits until a close this side requested has gone out on the wire.
async fn flush_close(incoming: &mut mpsc::Receiver<Inbound>) {
    match timeout(CLOSE_FLUSH_TIMEOUT, wait_for_close(incoming)).await {
        Ok(reason) => trace!(?reason, "close confirmed"),
        Err(_) => debug!("transport did not confirm the close in time"),
    }
}

fn finish(id: &str, outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::ClosedRemotely(reason) if !reason.is_clean() => {
            warn!(%id, ?reason, "session closed abnormally");
        }
        _ => info!(%id, ?outcome, "session closed"),
    }
}

async fn drive_producer(
    streamer: PositionStreamer,
    connection: Connection,
    period: Duration,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
    registration: Registration,
) -> SessionOutcome {
    let Connection {
        outgoing,
        mut incoming,
    } = connection;

    let outcome = select! {
        streamed = run_streamer(streamer, &outgoing, period, cancel.clone()) => match streamed {
            StreamOutcome::Finished { sent } => {
                flush_close(&mut incoming).await;
                SessionOutcome::Finished { sent }
            }
            StreamOutcome::Interrupted { sent } if cancel.is_cancelled() => {
                debug!(sent, "taxi stopped locally");
                outgoing.close().await;
                flush_close(&mut incoming).await;
                SessionOutcome::ClosedLocally
            }
            StreamOutcome::Interrupted { sent } => {
                debug!(sent, "taxi lost its connection");
                SessionOutcome::ClosedRemotely(pending_close(&mut incoming))
            }
        },
        reason = wait_for_close(&mut incoming) => SessionOutcome::ClosedRemotely(reason),
    };
    // Stops any tick still scheduled.
    cancel.cancel();

    let id = registration.id.clone();
    drop(registration);
    status.send_replace(SessionStatus::Closed);
    finish(&id, &outcome);
    outcome
}

async fn drive_consumer(
    mut aggregator: FeedAggregator,
    connection: Connection,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
    registration: Registration,
) -> SessionOutcome {
    let Connection {
        outgoing,
        mut incoming,
    } = connection;

    let outcome = loop {
        select! {
            _ = cancel.cancelled() => {
                outgoing.close().await;
                flush_close(&mut incoming).await;
                break SessionOutcome::ClosedLocally;
            }
            event = incoming.recv() => match event {
                // Malformed batches are logged by the aggregator and dropped.
                Some(Inbound::Text(text)) => {
                    let _ = aggregator.apply(&text);
                }
                Some(Inbound::Closed(reason)) => break SessionOutcome::ClosedRemotely(reason),
                None => break SessionOutcome::ClosedRemotely(CloseReason::Abnormal("transport dropped".into())),
            },
        }
    };

    let id = registration.id.clone();
    drop(registration);
    status.send_replace(SessionStatus::Closed);
    finish(&id, &outcome);
    outcome
}
