//! Progress event publication.
//!
//! Two named streams, `download_progress` and `verification_progress`,
//! carry events keyed by repository. Publication is fire-and-forget over
//! bounded broadcast channels: a slow subscriber lags and loses the oldest
//! events rather than ever blocking a publisher.

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Capacity of each broadcast ring. Laggards drop the oldest events.
const CHANNEL_CAPACITY: usize = 256;

/// Download-stream event names.
pub mod download_event {
    /// Download announced: `total_files`, `known_bytes`,
    /// optional `expected_total_bytes`.
    pub const START: &str = "start";
    /// One file finished: `file_name`, `completed_files`, `total_files`.
    pub const FILE_COMPLETE: &str = "file_complete";
    /// Whole run finished: `completed_files`, `total_files`,
    /// `overall_total_bytes`.
    pub const COMPLETE: &str = "complete";
}

/// Verification-stream event names.
pub mod verification_event {
    /// Repair pass started: `missing_files`, `corrupt_files`.
    pub const REPAIR_START: &str = "repair_start";
    /// Repair pass finished: `repaired_files`.
    pub const REPAIR_COMPLETE: &str = "repair_complete";
}

/// One published event: a name plus a free-form key/value payload, keyed
/// by the repository it concerns.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Normalized `owner/repo` the event belongs to.
    pub hub_id: String,
    /// Event name (see [`download_event`] and [`verification_event`]).
    pub event: String,
    /// Stable string keys with JSON values.
    pub payload: BTreeMap<String, Value>,
}

impl ProgressUpdate {
    /// Build an update from an iterator of key/value pairs.
    #[must_use]
    pub fn new(
        hub_id: &str,
        event: &str,
        payload: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> Self {
        Self {
            hub_id: hub_id.to_owned(),
            event: event.to_owned(),
            payload: payload
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        }
    }
}

/// Publisher for the two progress streams.
///
/// Cheap to clone; clones publish into the same streams.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    download: broadcast::Sender<ProgressUpdate>,
    verification: broadcast::Sender<ProgressUpdate>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    /// Create a bus with no subscribers yet.
    #[must_use]
    pub fn new() -> Self {
        let (download, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (verification, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            download,
            verification,
        }
    }

    /// Subscribe to `download_progress`.
    #[must_use]
    pub fn subscribe_download(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.download.subscribe()
    }

    /// Subscribe to `verification_progress`.
    #[must_use]
    pub fn subscribe_verification(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.verification.subscribe()
    }

    /// Publish to `download_progress`. Never blocks; events published with
    /// no live subscriber are dropped.
    pub fn publish_download(
        &self,
        hub_id: &str,
        event: &str,
        payload: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        let _ = self.download.send(ProgressUpdate::new(hub_id, event, payload));
    }

    /// Publish to `verification_progress`. Never blocks.
    pub fn publish_verification(
        &self,
        hub_id: &str,
        event: &str,
        payload: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        let _ = self
            .verification
            .send(ProgressUpdate::new(hub_id, event, payload));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_download_events_in_order() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe_download();

        bus.publish_download(
            "owner/repo",
            download_event::START,
            [("total_files", json!(3)), ("known_bytes", json!(1024))],
        );
        bus.publish_download(
            "owner/repo",
            download_event::FILE_COMPLETE,
            [
                ("file_name", json!("config.json")),
                ("completed_files", json!(1)),
                ("total_files", json!(3)),
            ],
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, download_event::START);
        assert_eq!(first.hub_id, "owner/repo");
        assert_eq!(first.payload["total_files"], json!(3));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, download_event::FILE_COMPLETE);
        assert_eq!(second.payload["file_name"], json!("config.json"));
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let bus = ProgressBus::new();
        let mut download_rx = bus.subscribe_download();
        let mut verification_rx = bus.subscribe_verification();

        bus.publish_verification(
            "owner/repo",
            verification_event::REPAIR_START,
            [("missing_files", json!(2)), ("corrupt_files", json!(0))],
        );

        let update = verification_rx.recv().await.unwrap();
        assert_eq!(update.event, verification_event::REPAIR_START);
        assert!(
            download_rx.try_recv().is_err(),
            "verification events must not appear on the download stream"
        );
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new();
        bus.publish_download("owner/repo", download_event::COMPLETE, []);
        bus.publish_verification("owner/repo", verification_event::REPAIR_COMPLETE, []);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe_download();

        for i in 0..(CHANNEL_CAPACITY + 16) {
            bus.publish_download("owner/repo", download_event::FILE_COMPLETE, [(
                "completed_files",
                json!(i),
            )]);
        }

        // The oldest events were dropped; the receiver reports the lag and
        // then resumes from the oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 16),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }
}
