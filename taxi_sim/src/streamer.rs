//! Drives one simulated taxi along its route.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    select,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{bearing::bearing, codec::PositionMessage, geo::Route, transport::Outgoing};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("route has no points")]
pub struct EmptyRoute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Idle,
    Streaming,
    Finished,
}

/// Per-taxi state machine: `Idle -> Streaming -> Finished`.
///
/// Each call to [`next_tick`](Self::next_tick) yields the position for the
/// current cursor. The first tick has heading 0 since there is no previous
/// point; every later tick carries the bearing from the previous point.
#[derive(Debug, Clone)]
pub struct PositionStreamer {
    route: Route,
    cursor: usize,
    state: StreamerState,
}

impl PositionStreamer {
    pub fn new(route: Route) -> Result<Self, EmptyRoute> {
        if route.is_empty() {
            return Err(EmptyRoute);
        }
        Ok(Self {
            route,
            cursor: 0,
            state: StreamerState::Idle,
        })
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Index of the last emitted point.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamerState::Finished
    }

    /// Produces the next position, or `None` once finished.
    pub fn next_tick(&mut self) -> Option<PositionMessage> {
        let heading = match self.state {
            StreamerState::Finished => return None,
            StreamerState::Idle => {
                self.state = StreamerState::Streaming;
                0.0
            }
            StreamerState::Streaming => {
                let previous = self.route.get(self.cursor)?;
                self.cursor += 1;
                bearing(previous, self.route.get(self.cursor)?)
            }
        };
        let point = self.route.get(self.cursor)?;

        if self.cursor + 1 == self.route.len() {
            self.state = StreamerState::Finished;
        }
        Some(PositionMessage::new(point, heading))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every point was sent and the connection was closed.
    Finished { sent: usize },
    /// Stopped early by cancellation or because the connection went away.
    Interrupted { sent: usize },
}

/// Sends one position per `period` until the route is exhausted, then closes
/// the connection.
///
/// The first tick fires immediately. Ticks are scheduled from tick start and
/// never overlap; a slow send delays the next tick but none are dropped.
/// Closed state and cancellation are checked before every tick, so nothing is
/// sent after either.
pub async fn run_streamer(
    mut streamer: PositionStreamer,
    outgoing: &Outgoing,
    period: Duration,
    cancel: CancellationToken,
) -> StreamOutcome {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut sent = 0;

    loop {
        select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Interrupted { sent },
            _ = ticker.tick() => {}
        }
        if cancel.is_cancelled() || outgoing.is_closed() {
            return StreamOutcome::Interrupted { sent };
        }

        let Some(message) = streamer.next_tick() else {
            return StreamOutcome::Finished { sent };
        };
        debug!(tick = streamer.cursor(), %message, "tick");
        if outgoing.send_text(message.to_string()).await.is_err() {
            return StreamOutcome::Interrupted { sent };
        }
        sent += 1;

        if streamer.is_finished() {
            outgoing.close().await;
            return StreamOutcome::Finished { sent };
        }
    }
}
