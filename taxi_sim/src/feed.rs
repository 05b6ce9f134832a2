//! Consumer-side view of the live feed.

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec::{parse_feed_batch, FeedBatch, FeedRecord, ProtocolError, Role};

/// One displayed row.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRow {
    pub kind: Role,
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&FeedRecord> for FeedRow {
    fn from(record: &FeedRecord) -> Self {
        Self {
            kind: Role::Producer,
            id: record.producer_id.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
        }
    }
}

impl fmt::Display for FeedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<6} {:<36} {:>11.6} {:>11.6}",
            self.kind, self.id, self.latitude, self.longitude
        )
    }
}

/// Rows for a batch, sorted by id so the table does not jump around.
pub fn rows(batch: &FeedBatch) -> Vec<FeedRow> {
    let mut rows: Vec<FeedRow> = batch.records.iter().map(FeedRow::from).collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    rows
}

/// Holds the feed currently on display.
///
/// Each accepted batch replaces the previous one entirely. Malformed batches
/// are logged and dropped, leaving the displayed feed as it was.
#[derive(Debug)]
pub struct FeedAggregator {
    current: FeedBatch,
    publisher: watch::Sender<FeedBatch>,
    rejected: u64,
}

impl Default for FeedAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedAggregator {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(FeedBatch::default());
        Self {
            current: FeedBatch::default(),
            publisher,
            rejected: 0,
        }
    }

    /// Receives every batch accepted from now on.
    pub fn subscribe(&self) -> watch::Receiver<FeedBatch> {
        self.publisher.subscribe()
    }

    pub fn apply(&mut self, raw: &str) -> Result<&FeedBatch, ProtocolError> {
        match parse_feed_batch(raw) {
            Ok(batch) => {
                debug!(taxis = batch.len(), "feed batch");
                self.current = batch;
                self.publisher.send_replace(self.current.clone());
                Ok(&self.current)
            }
            Err(e) => {
                self.rejected += 1;
                warn!(error = %e, "dropping malformed feed batch");
                Err(e)
            }
        }
    }

    pub fn current(&self) -> &FeedBatch {
        &self.current
    }

    pub fn rows(&self) -> Vec<FeedRow> {
        rows(&self.current)
    }

    /// Number of batches dropped as malformed.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_batch_replaces_previous() {
        let mut feed = FeedAggregator::new();
        feed.apply("taxis-51.5,-0.12&abc$51.6,-0.13&def").unwrap();
        assert_eq!(feed.current().len(), 2);

        feed.apply("taxis-52.0,-1.0&xyz").unwrap();
        let rows = feed.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "xyz");
        assert_eq!(rows[0].kind, Role::Producer);
    }

    #[test]
    fn malformed_batch_keeps_current_feed() {
        let mut feed = FeedAggregator::new();
        feed.apply("taxis-51.5,-0.12&abc").unwrap();
        assert!(feed.apply("taxis-51.5&abc").is_err());
        assert!(feed.apply("hello").is_err());
        assert_eq!(feed.current().len(), 1);
        assert_eq!(feed.rejected(), 2);
    }

    #[test]
    fn empty_batch_clears_the_table() {
        let mut feed = FeedAggregator::new();
        feed.apply("taxis-51.5,-0.12&abc").unwrap();
        feed.apply("taxis-").unwrap();
        assert!(feed.rows().is_empty());
    }

    #[test]
    fn rows_are_sorted_by_id() {
        let mut feed = FeedAggregator::new();
        feed.apply("taxis-1,1&zed$2,2&amy$3,3&kim").unwrap();
        let ids: Vec<_> = feed.rows().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["amy", "kim", "zed"]);
    }

    #[tokio::test]
    async fn subscribers_see_each_accepted_batch() {
        let mut feed = FeedAggregator::new();
        let mut updates = feed.subscribe();

        feed.apply("taxis-51.5,-0.12&abc").unwrap();
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().len(), 1);

        let _ = feed.apply("garbage");
        assert!(!updates.has_changed().unwrap());
    }
}
