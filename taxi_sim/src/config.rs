//! Simulator settings.

use std::time::Duration;

use crate::polyline::DEFAULT_PRECISION;

pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:4200";

/// Period between two position updates of one taxi.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1700);

/// Frames queued per connection before senders wait.
pub const DEFAULT_CHANNEL_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Hub address, `ws://host:port`.
    pub server: String,
    /// Base URL of the route service. The hub does not serve routes, so
    /// there is no default.
    pub route_service: Option<String>,
    pub tick_interval: Duration,
    pub precision: u32,
    pub channel_buffer: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            route_service: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            precision: DEFAULT_PRECISION,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}
