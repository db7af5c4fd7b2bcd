//! Typed channel for presence lifecycle events
//!
//! The collection calls its listener while holding the registry lock, so the
//! listener here only snapshots the fingerprint and does a bounded
//! `try_send`. Reporting happens in whichever task drains the receiver.

use crate::domain::types::epoch_ms;
use crate::infra::metrics::Metrics;
use crate::services::collection::PresenceListener;
use crate::services::fingerprint::{Fingerprint, FingerprintReport, Lifecycle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Event published by the collection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Admission was enabled or paused
    Admission { enabled: bool, ts: u64 },
    /// A fingerprint changed state
    Lifecycle { kind: LifecycleKind, ts: u64, fingerprint: FingerprintReport },
}

/// Lifecycle transition as reported, including eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Add,
    Reopen,
    Close,
    Left,
    CountAdd,
    CountDel,
    Del,
}

impl From<Lifecycle> for LifecycleKind {
    fn from(value: Lifecycle) -> Self {
        match value {
            Lifecycle::Add => Self::Add,
            Lifecycle::Reopen => Self::Reopen,
            Lifecycle::Close => Self::Close,
            Lifecycle::Left => Self::Left,
            Lifecycle::CountAdd => Self::CountAdd,
            Lifecycle::CountDel => Self::CountDel,
        }
    }
}

impl PresenceEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Listener that forwards lifecycle events into a bounded channel
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<PresenceEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl EventSender {
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Non-blocking send; drops and counts when the consumer falls behind
    pub fn send(&self, event: PresenceEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_event_dropped();
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("presence_event_channel_closed");
            }
        }
    }

    fn send_lifecycle(&self, kind: LifecycleKind, fingerprint: &Fingerprint) {
        self.send(PresenceEvent::Lifecycle { kind, ts: epoch_ms(), fingerprint: fingerprint.report() });
    }
}

impl PresenceListener for EventSender {
    fn on_seen(&self, enabled: bool) {
        self.send(PresenceEvent::Admission { enabled, ts: epoch_ms() });
    }

    fn on_add(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::Add, fingerprint);
    }

    fn on_del(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::Del, fingerprint);
    }

    fn on_close(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::Close, fingerprint);
    }

    fn on_left(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::Left, fingerprint);
    }

    fn on_count_add(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::CountAdd, fingerprint);
    }

    fn on_count_del(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::CountDel, fingerprint);
    }

    fn on_reopen(&self, fingerprint: &Fingerprint) {
        self.send_lifecycle(LifecycleKind::Reopen, fingerprint);
    }
}

/// Create a bounded event channel
pub fn create_event_channel(buffer_size: usize) -> (EventSender, mpsc::Receiver<PresenceEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EventSender { tx, metrics: None }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Advertisement;
    use crate::services::collection::FingerprintCollection;
    use crate::services::tunables::Tunables;

    fn adv(rssi: i32) -> Advertisement {
        Advertisement::new("aa:bb:cc:dd:ee:ff".parse().unwrap(), rssi)
    }

    #[test]
    fn test_lifecycle_kind_from() {
        assert_eq!(LifecycleKind::from(Lifecycle::CountAdd), LifecycleKind::CountAdd);
        assert_eq!(LifecycleKind::from(Lifecycle::Left), LifecycleKind::Left);
    }

    #[tokio::test]
    async fn test_collection_events_reach_channel() {
        let (sender, mut rx) = create_event_channel(16);
        let collection = FingerprintCollection::new(Tunables::default()).with_listener(Arc::new(sender));

        collection.seen_at(&adv(-60), 0);
        collection.set_disable(true);

        match rx.recv().await.unwrap() {
            PresenceEvent::Lifecycle { kind, fingerprint, .. } => {
                assert_eq!(kind, LifecycleKind::Add);
                assert_eq!(fingerprint.id, "aabbccddeeff");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), PresenceEvent::Admission { enabled: false, .. }));
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_event_channel(1);
        let sender = sender.with_metrics(metrics.clone());

        sender.on_seen(true);
        sender.on_seen(false);
        sender.on_seen(true);
        assert_eq!(metrics.events_dropped_total(), 2);
    }

    #[test]
    fn test_event_json_shape() {
        let event = PresenceEvent::Admission { enabled: true, ts: 42 };
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["event"], "admission");
        assert_eq!(json["enabled"], true);
        assert_eq!(json["ts"], 42);
    }
}
