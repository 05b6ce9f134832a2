//! Geographic primitives shared by the decoder, the bearing calculation and
//! the streamer.

use std::fmt;

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// An ordered, read-only sequence of points. Index order is travel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    points: Vec<GeoPoint>,
}

impl Route {
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<GeoPoint> {
        self.points.get(index).copied()
    }

    pub fn first(&self) -> Option<GeoPoint> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<GeoPoint> {
        self.points.last().copied()
    }
}

impl From<Vec<GeoPoint>> for Route {
    fn from(points: Vec<GeoPoint>) -> Self {
        Self { points }
    }
}

impl FromIterator<GeoPoint> for Route {
    fn from_iter<I: IntoIterator<Item = GeoPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}
