//! # Dashboard Stream
//!
//! A push-based telemetry stream for external observers. Each subscriber
//! supplies a filter over module names; frames not matching any subscribed
//! module are dropped at the sender, not the receiver. A bounded channel
//! provides backpressure: a slow subscriber has frames dropped rather than
//! blocking the publisher. Subscribers that miss their heartbeat window are
//! reaped on the next `prune_stale` call.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::clock::SharedClock;
use crate::types::{ModuleId, TimestampMs};

/// One frame pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DashboardFrame {
    /// Sent immediately on subscribe, before any live data
    Welcome {
        /// Modules this subscriber is filtered to
        modules: Vec<ModuleId>,
    },
    /// A metrics update for one module
    MetricsUpdate {
        /// Module the update describes
        module: ModuleId,
        /// Arbitrary snapshot payload
        payload: serde_json::Value,
    },
    /// A heartbeat, to let subscribers detect a stalled stream
    Heartbeat {
        /// Server time at heartbeat
        at: TimestampMs,
    },
}

/// Default channel depth per subscriber before frames are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Default time a subscriber may go without acknowledging a heartbeat before
/// being pruned, milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: i64 = 30_000;

struct Subscriber {
    id: u64,
    filter: HashSet<ModuleId>,
    sender: mpsc::Sender<DashboardFrame>,
    last_heartbeat: TimestampMs,
}

/// Manages dashboard subscribers and pushes filtered frames to them.
pub struct DashboardStream {
    clock: SharedClock,
    subscribers: tokio::sync::RwLock<Vec<Subscriber>>,
    next_id: std::sync::atomic::AtomicU64,
    channel_capacity: usize,
    heartbeat_timeout_ms: i64,
}

impl DashboardStream {
    /// Create a stream with default channel capacity and heartbeat timeout.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_config(clock, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HEARTBEAT_TIMEOUT_MS)
    }

    /// Create a stream with explicit channel capacity and heartbeat timeout.
    pub fn with_config(clock: SharedClock, channel_capacity: usize, heartbeat_timeout_ms: i64) -> Self {
        Self {
            clock,
            subscribers: tokio::sync::RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
            channel_capacity,
            heartbeat_timeout_ms,
        }
    }

    /// Subscribe with a module filter, receiving a welcome frame immediately.
    /// An empty filter means "all modules". Returns the subscriber id
    /// alongside the receiver so the caller can later call [`set_filters`]
    /// or [`unsubscribe`] on it.
    ///
    /// [`set_filters`]: DashboardStream::set_filters
    /// [`unsubscribe`]: DashboardStream::unsubscribe
    #[instrument(skip(self))]
    pub async fn subscribe(&self, modules: Vec<ModuleId>) -> (u64, mpsc::Receiver<DashboardFrame>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let now = self.clock.now_ms();

        let _ = tx.try_send(DashboardFrame::Welcome { modules: modules.clone() });

        let mut subs = self.subscribers.write().await;
        subs.push(Subscriber {
            id,
            filter: modules.into_iter().collect(),
            sender: tx,
            last_heartbeat: now,
        });
        debug!(subscriber_id = id, "dashboard subscriber registered");
        (id, rx)
    }

    /// Replace `subscriber_id`'s module filter. An empty filter means "all
    /// modules". Returns `false` if the subscriber is unknown.
    #[instrument(skip(self))]
    pub async fn set_filters(&self, subscriber_id: u64, modules: Vec<ModuleId>) -> bool {
        let mut subs = self.subscribers.write().await;
        match subs.iter_mut().find(|s| s.id == subscriber_id) {
            Some(sub) => {
                sub.filter = modules.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Explicitly remove `subscriber_id`, dropping its sender. Returns
    /// `false` if the subscriber was already gone.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, subscriber_id: u64) -> bool {
        let mut subs = self.subscribers.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != subscriber_id);
        let removed = subs.len() != before;
        if removed {
            debug!(subscriber_id, "dashboard subscriber removed");
        }
        removed
    }

    /// Push a metrics update for `module`; delivered only to subscribers
    /// whose filter includes it (or is empty). Backpressure drops the frame
    /// for that subscriber rather than blocking.
    #[instrument(skip(self, payload))]
    pub async fn publish_metrics(&self, module: &str, payload: serde_json::Value) {
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            if sub.filter.is_empty() || sub.filter.contains(module) {
                let frame = DashboardFrame::MetricsUpdate {
                    module: module.to_string(),
                    payload: payload.clone(),
                };
                if sub.sender.try_send(frame).is_err() {
                    warn!(subscriber_id = sub.id, module, "dashboard subscriber backpressured, dropping frame");
                }
            }
        }
    }

    /// Send a heartbeat frame to every subscriber.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) {
        let now = self.clock.now_ms();
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            let _ = sub.sender.try_send(DashboardFrame::Heartbeat { at: now });
        }
    }

    /// Record that `subscriber_id` acknowledged a heartbeat, resetting its timeout.
    pub async fn acknowledge(&self, subscriber_id: u64) {
        let now = self.clock.now_ms();
        let mut subs = self.subscribers.write().await;
        if let Some(sub) = subs.iter_mut().find(|s| s.id == subscriber_id) {
            sub.last_heartbeat = now;
        }
    }

    /// Remove subscribers that haven't acknowledged a heartbeat within the
    /// configured timeout. Returns the number pruned.
    #[instrument(skip(self))]
    pub async fn prune_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let mut subs = self.subscribers.write().await;
        let before = subs.len();
        subs.retain(|s| now - s.last_heartbeat < self.heartbeat_timeout_ms);
        let pruned = before - subs.len();
        if pruned > 0 {
            debug!(pruned, "pruned stale dashboard subscribers");
        }
        pruned
    }

    /// Number of currently registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn subscriber_receives_welcome_frame() {
        let stream = DashboardStream::new(Arc::new(VirtualClock::new(0)));
        let (_id, mut rx) = stream.subscribe(vec!["qflow".to_string()]).await;
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, DashboardFrame::Welcome { .. }));
    }

    #[tokio::test]
    async fn filter_excludes_unrelated_modules() {
        let stream = DashboardStream::new(Arc::new(VirtualClock::new(0)));
        let (_id, mut rx) = stream.subscribe(vec!["qflow".to_string()]).await;
        rx.recv().await.unwrap(); // welcome

        stream.publish_metrics("qindex", serde_json::json!({})).await;
        stream.publish_metrics("qflow", serde_json::json!({"ok": true})).await;

        let frame = rx.recv().await.unwrap();
        match frame {
            DashboardFrame::MetricsUpdate { module, .. } => assert_eq!(module, "qflow"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_filter_receives_every_module() {
        let stream = DashboardStream::new(Arc::new(VirtualClock::new(0)));
        let (_id, mut rx) = stream.subscribe(vec![]).await;
        rx.recv().await.unwrap(); // welcome

        stream.publish_metrics("anything", serde_json::json!({})).await;
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, DashboardFrame::MetricsUpdate { .. }));
    }

    #[tokio::test]
    async fn stale_subscriber_is_pruned() {
        let clock = Arc::new(VirtualClock::new(0));
        let stream = DashboardStream::with_config(clock.clone(), 128, 5_000);
        let (_id, _rx) = stream.subscribe(vec![]).await;
        assert_eq!(stream.subscriber_count().await, 1);

        clock.advance(5_001);
        let pruned = stream.prune_stale().await;
        assert_eq!(pruned, 1);
        assert_eq!(stream.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn backpressure_drops_rather_than_blocks() {
        let stream = DashboardStream::with_config(Arc::new(VirtualClock::new(0)), 1, 30_000);
        let (_id, _rx) = stream.subscribe(vec![]).await; // consumes capacity-1 slot with welcome

        // Channel capacity is 1 and the welcome frame already occupies it;
        // publishing should drop rather than hang.
        stream.publish_metrics("qflow", serde_json::json!({})).await;
        stream.publish_metrics("qflow", serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn set_filters_changes_what_a_subscriber_receives() {
        let stream = DashboardStream::new(Arc::new(VirtualClock::new(0)));
        let (id, mut rx) = stream.subscribe(vec!["qflow".to_string()]).await;
        rx.recv().await.unwrap(); // welcome

        assert!(stream.set_filters(id, vec!["qindex".to_string()]).await);

        stream.publish_metrics("qflow", serde_json::json!({})).await;
        stream.publish_metrics("qindex", serde_json::json!({"ok": true})).await;

        let frame = rx.recv().await.unwrap();
        match frame {
            DashboardFrame::MetricsUpdate { module, .. } => assert_eq!(module, "qindex"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscriber() {
        let stream = DashboardStream::new(Arc::new(VirtualClock::new(0)));
        let (id, _rx) = stream.subscribe(vec![]).await;
        assert_eq!(stream.subscriber_count().await, 1);

        assert!(stream.unsubscribe(id).await);
        assert_eq!(stream.subscriber_count().await, 0);
        assert!(!stream.unsubscribe(id).await);
    }
}
