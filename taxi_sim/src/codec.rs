//! Text wire format spoken between taxis, the hub and clients.
//!
//! Taxi to hub: `pos#<lat>,<lon>,<heading>`.
//! Hub to client: `taxis-<lat>,<lon>&<id>$<lat>,<lon>&<id>...`.
//! The role is not part of any message; it travels as the connection's
//! sub-protocol, and the initial position and id travel in the subscribe
//! query string.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::geo::GeoPoint;

pub const POSITION_PREFIX: &str = "pos#";
pub const FEED_PREFIX: &str = "taxis-";
pub const RECORD_SEPARATOR: char = '$';
pub const ID_SEPARATOR: char = '&';
pub const FIELD_SEPARATOR: char = ',';

/// Characters an id may not contain, since the feed format has no escaping.
const RESERVED: [char; 5] = ['$', '&', ',', '#', '='];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message does not start with {expected:?}")]
    MissingPrefix { expected: &'static str },

    #[error("record {record:?} is missing its {field}")]
    MissingField { record: String, field: &'static str },

    #[error("invalid {field} {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("record {record:?} has too many fields")]
    TooManyFields { record: String },

    #[error("unknown role {0:?}")]
    UnknownRole(String),

    #[error("invalid id {0:?}")]
    InvalidId(String),
}

/// Which side of the feed a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A taxi publishing its own position.
    Producer,
    /// An observer receiving the aggregated feed.
    Consumer,
}

impl Role {
    /// Sub-protocol offered when connecting.
    pub const fn protocol(self) -> &'static str {
        match self {
            Role::Producer => "map-taxi",
            Role::Consumer => "map-client",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Role::Producer => "taxi",
            Role::Consumer => "client",
        }
    }

    /// Accepts both the bare and the `map-` prefixed spelling.
    pub fn from_tag(tag: &str) -> Option<Role> {
        match tag.trim() {
            "taxi" | "map-taxi" => Some(Role::Producer),
            "client" | "map-client" => Some(Role::Consumer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::from_tag(s).ok_or_else(|| ProtocolError::UnknownRole(s.to_string()))
    }
}

/// Checks that `id` can be embedded in a feed record and a query string.
pub fn validate_id(id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || RESERVED.contains(&c)) {
        return Err(ProtocolError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// One taxi's current state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMessage {
    pub latitude: f64,
    pub longitude: f64,
    pub heading_degrees: f64,
}

impl PositionMessage {
    pub fn new(point: GeoPoint, heading_degrees: f64) -> Self {
        Self {
            latitude: point.latitude,
            longitude: point.longitude,
            heading_degrees,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Heading as sent on the wire: truncated to whole degrees.
    pub fn heading(&self) -> i32 {
        self.heading_degrees.trunc() as i32
    }
}

impl fmt::Display for PositionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{POSITION_PREFIX}{},{},{}",
            self.latitude,
            self.longitude,
            self.heading()
        )
    }
}

impl FromStr for PositionMessage {
    type Err = ProtocolError;

    /// Parses `pos#<lat>,<lon>[,<heading>]`; a missing heading reads as 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix(POSITION_PREFIX).ok_or(ProtocolError::MissingPrefix {
            expected: POSITION_PREFIX,
        })?;
        let mut fields = body.split(FIELD_SEPARATOR);
        let latitude = parse_coordinate(body, fields.next(), "latitude")?;
        let longitude = parse_coordinate(body, fields.next(), "longitude")?;
        let heading_degrees = match fields.next() {
            Some(value) => f64::from(parse_heading(value)?),
            None => 0.0,
        };
        if fields.next().is_some() {
            return Err(ProtocolError::TooManyFields {
                record: body.to_string(),
            });
        }
        Ok(Self {
            latitude,
            longitude,
            heading_degrees,
        })
    }
}

/// One entry of a feed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub producer_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl fmt::Display for FeedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}{ID_SEPARATOR}{}",
            self.latitude, self.longitude, self.producer_id
        )
    }
}

/// Snapshot of every known taxi at one broadcast. Order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub records: Vec<FeedRecord>,
}

impl FeedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, producer_id: &str) -> Option<&FeedRecord> {
        self.records.iter().find(|r| r.producer_id == producer_id)
    }
}

impl fmt::Display for FeedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(FEED_PREFIX)?;
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, "{RECORD_SEPARATOR}")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

impl FromStr for FeedBatch {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_feed_batch(s)
    }
}

/// Parses a hub broadcast. `taxis-` with nothing after it is an empty batch.
pub fn parse_feed_batch(raw: &str) -> Result<FeedBatch, ProtocolError> {
    let body = raw.strip_prefix(FEED_PREFIX).ok_or(ProtocolError::MissingPrefix {
        expected: FEED_PREFIX,
    })?;
    if body.is_empty() {
        return Ok(FeedBatch::default());
    }
    let records = body
        .split(RECORD_SEPARATOR)
        .map(parse_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FeedBatch { records })
}

fn parse_record(record: &str) -> Result<FeedRecord, ProtocolError> {
    let missing = |field| ProtocolError::MissingField {
        record: record.to_string(),
        field,
    };
    let (position, producer_id) = record.split_once(ID_SEPARATOR).ok_or_else(|| missing("id"))?;
    if producer_id.is_empty() {
        return Err(missing("id"));
    }
    validate_id(producer_id)?;

    let mut fields = position.split(FIELD_SEPARATOR);
    let latitude = parse_coordinate(record, fields.next(), "latitude")?;
    let longitude = parse_coordinate(record, fields.next(), "longitude")?;
    // Some hubs append the heading; it is not part of the feed.
    if let Some(heading) = fields.next() {
        parse_heading(heading)?;
    }
    if fields.next().is_some() {
        return Err(ProtocolError::TooManyFields {
            record: record.to_string(),
        });
    }

    Ok(FeedRecord {
        producer_id: producer_id.to_string(),
        latitude,
        longitude,
    })
}

fn parse_coordinate(
    record: &str,
    value: Option<&str>,
    field: &'static str,
) -> Result<f64, ProtocolError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProtocolError::MissingField {
            record: record.to_string(),
            field,
        })?;
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn parse_heading(value: &str) -> Result<i16, ProtocolError> {
    value
        .trim()
        .parse::<i16>()
        .map_err(|_| ProtocolError::InvalidNumber {
            field: "heading",
            value: value.to_string(),
        })
}

/// Parameters carried by the subscribe request's query string.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeParams {
    pub id: String,
    pub position: GeoPoint,
    pub heading: i16,
}

impl SubscribeParams {
    pub fn to_query(&self) -> String {
        format!(
            "id={}&lat={}&lon={}&head={}",
            self.id, self.position.latitude, self.position.longitude, self.heading
        )
    }

    /// Parses `id=..&lat=..&lon=..&head=..` in any order. `head` may be
    /// omitted.
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        let mut id = None;
        let mut lat = None;
        let mut lon = None;
        let mut head = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "id" => id = Some(value),
                "lat" => lat = Some(value),
                "lon" => lon = Some(value),
                "head" => head = Some(value),
                _ => {}
            }
        }

        let id = id.ok_or_else(|| ProtocolError::MissingField {
            record: query.to_string(),
            field: "id",
        })?;
        validate_id(id)?;
        let latitude = parse_coordinate(query, lat, "latitude")?;
        let longitude = parse_coordinate(query, lon, "longitude")?;
        let heading = head.map(parse_heading).transpose()?.unwrap_or(0);

        Ok(Self {
            id: id.to_string(),
            position: GeoPoint::new(latitude, longitude),
            heading,
        })
    }
}
