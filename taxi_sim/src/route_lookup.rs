//! Fetches encoded routes from the directions service.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    geo::Route,
    polyline::{self, DecodeError},
};

#[derive(Debug, Error)]
pub enum RouteLookupError {
    #[error("route request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed directions response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no route from {from:?} to {to:?}")]
    NoRoute { from: String, to: String },

    #[error("route polyline is malformed: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    overview_polyline: OverviewPolyline,
}

#[derive(Debug, Deserialize)]
struct OverviewPolyline {
    points: String,
}

/// Source of encoded polylines between two places.
#[async_trait]
pub trait RouteLookup: Send + Sync {
    async fn polyline(&self, from: &str, to: &str) -> Result<String, RouteLookupError>;
}

/// Extracts the first route's overview polyline from a directions response.
pub fn polyline_from_response(
    body: &[u8],
    from: &str,
    to: &str,
) -> Result<String, RouteLookupError> {
    let routes: Vec<DirectionsRoute> = serde_json::from_slice(body)?;
    routes
        .into_iter()
        .next()
        .map(|route| route.overview_polyline.points)
        .ok_or_else(|| RouteLookupError::NoRoute {
            from: from.to_string(),
            to: to.to_string(),
        })
}

/// `GET <base>/route?from=..&to=..`.
#[derive(Debug, Clone)]
pub struct HttpRouteLookup {
    client: reqwest::Client,
    base: String,
}

impl HttpRouteLookup {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into(),
        }
    }
}

#[async_trait]
impl RouteLookup for HttpRouteLookup {
    async fn polyline(&self, from: &str, to: &str) -> Result<String, RouteLookupError> {
        let url = format!("{}/route", self.base.trim_end_matches('/'));
        debug!(%url, from, to, "requesting route");
        let body = self
            .client
            .get(&url)
            .query(&[("from", from), ("to", to)])
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        polyline_from_response(&body, from, to)
    }
}

/// Looks up and decodes the route between two places.
pub async fn fetch_route(
    lookup: &dyn RouteLookup,
    from: &str,
    to: &str,
    precision: u32,
) -> Result<Route, RouteLookupError> {
    let encoded = lookup.polyline(from, to).await?;
    Ok(polyline::decode(&encoded, precision)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl RouteLookup for Fixed {
        async fn polyline(&self, _from: &str, _to: &str) -> Result<String, RouteLookupError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn reads_first_overview_polyline() {
        let body = br#"[
            {"summary": "A1", "overview_polyline": {"points": "_p~iF~ps|U"}, "legs": []},
            {"summary": "A2", "overview_polyline": {"points": "ignored"}}
        ]"#;
        let points = polyline_from_response(body, "a", "b").unwrap();
        assert_eq!(points, "_p~iF~ps|U");
    }

    #[test]
    fn empty_response_means_no_route() {
        let err = polyline_from_response(b"[]", "a", "b").unwrap_err();
        assert!(matches!(err, RouteLookupError::NoRoute { .. }));
        let err = polyline_from_response(b"{}", "a", "b").unwrap_err();
        assert!(matches!(err, RouteLookupError::Json(_)));
    }

    #[tokio::test]
    async fn fetch_decodes_the_polyline() {
        let route = fetch_route(&Fixed("_p~iF~ps|U_ulLnnqC_mqNvxq`@"), "a", "b", 5)
            .await
            .unwrap();
        assert_eq!(route.len(), 3);

        let err = fetch_route(&Fixed("_p~iF"), "a", "b", 5).await.unwrap_err();
        assert!(matches!(err, RouteLookupError::Decode(_)));
    }
}
