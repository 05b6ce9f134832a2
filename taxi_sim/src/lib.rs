//! Simulated taxis streaming live positions to a hub, and the client that
//! watches the aggregated feed.

pub mod bearing;
pub mod codec;
pub mod config;
pub mod feed;
pub mod geo;
pub mod polyline;
pub mod route_lookup;
pub mod session;
pub mod streamer;
pub mod transport;

pub use bearing::bearing;
pub use codec::{parse_feed_batch, FeedBatch, FeedRecord, PositionMessage, ProtocolError, Role};
pub use config::SimConfig;
pub use feed::{FeedAggregator, FeedRow};
pub use geo::{GeoPoint, Route};
pub use polyline::{decode, DecodeError};
pub use session::{ConnectionManager, Session, SessionError, SessionOutcome, SessionStatus};
pub use streamer::{PositionStreamer, StreamOutcome, StreamerState};
pub use transport::{Connection, Connector, TransportError, WsConnector};
