//! Synchronous, in-process event bus.
//!
//! Subscribers register against a topic string; `"*"` subscribes to every
//! topic. Publishing walks matching subscribers in registration order and
//! delivers synchronously — a subscriber that errors is logged and skipped,
//! never allowed to abort delivery to the rest. A bounded ring buffer keeps
//! the most recent events per topic for late joiners and diagnostics.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::clock::SharedClock;
use crate::types::TimestampMs;

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Topic this event was published on
    pub topic: String,
    /// When it was published
    pub timestamp: TimestampMs,
    /// Event payload
    pub payload: serde_json::Value,
}

/// Subscriber callback type.
pub type SubscriberFn =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

struct Subscription {
    id: u64,
    topic: String,
    handler: SubscriberFn,
}

/// A filter for `EventBus::history`. `topic: None` merges every topic's
/// history sorted by timestamp; `since`/`limit` narrow the result further.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    topic: Option<String>,
    since: Option<TimestampMs>,
    limit: Option<usize>,
}

impl HistoryFilter {
    /// Match every topic.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only `topic`.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self { topic: Some(topic.into()), since: None, limit: None }
    }

    /// Only include events at or after `since`.
    pub fn since(mut self, since: TimestampMs) -> Self {
        self.since = Some(since);
        self
    }

    /// Cap the result to the most recent `limit` events.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Default number of events retained per topic for history queries.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Topic-based synchronous publish/subscribe bus.
#[derive(Clone)]
pub struct EventBus {
    clock: SharedClock,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    history: Arc<RwLock<HashMap<String, VecDeque<Event>>>>,
    history_capacity: usize,
    next_id: Arc<AtomicU64>,
}

/// A shared, cloneable handle to an [`EventBus`].
pub type SharedBus = Arc<EventBus>;

/// A handle returned from `subscribe` that removes the subscription when
/// consumed.
pub struct Unsubscribe {
    id: u64,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl Unsubscribe {
    /// Remove the subscription this handle was issued for.
    pub async fn unsubscribe(self) {
        let mut subs = self.subscriptions.write().await;
        subs.retain(|s| s.id != self.id);
    }
}

impl EventBus {
    /// Create a new bus with the default history capacity.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a new bus, bounding per-topic history to `capacity` events.
    pub fn with_capacity(clock: SharedClock, capacity: usize) -> Self {
        Self {
            clock,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            history_capacity: capacity,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to `topic` (or `"*"` for every topic). The returned handle
    /// removes the subscription when `unsubscribe` is called on it.
    #[instrument(skip(self, handler))]
    pub async fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> Unsubscribe
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handler: SubscriberFn = Arc::new(move |ev| Box::pin(handler(ev)));
        let mut subs = self.subscriptions.write().await;
        debug!(topic = %topic, subscription_id = id, "subscribed to topic");
        subs.push(Subscription { id, topic, handler });
        Unsubscribe { id, subscriptions: self.subscriptions.clone() }
    }

    /// Publish `payload` on `topic`, delivering synchronously to every
    /// matching subscriber. Subscriber errors are logged, not propagated.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) {
        let topic = topic.into();
        let event = Event {
            topic: topic.clone(),
            timestamp: self.clock.now_ms(),
            payload,
        };

        {
            let mut history = self.history.write().await;
            let ring = history.entry(topic.clone()).or_insert_with(VecDeque::new);
            ring.push_back(event.clone());
            while ring.len() > self.history_capacity {
                ring.pop_front();
            }
        }

        let subs = self.subscriptions.read().await;
        for sub in subs.iter() {
            if sub.topic == "*" || sub.topic == topic {
                if let Err(err) = (sub.handler)(event.clone()).await {
                    warn!(topic = %topic, error = %err, "subscriber failed, continuing delivery");
                }
            }
        }
    }

    /// Events matching `filter`, oldest first. A `None` topic merges every
    /// topic's ring, sorted by timestamp, before `since`/`limit` are applied.
    pub async fn history(&self, filter: HistoryFilter) -> Vec<Event> {
        let history = self.history.read().await;
        let mut events: Vec<Event> = match &filter.topic {
            Some(topic) => history.get(topic).map(|ring| ring.iter().cloned().collect()).unwrap_or_default(),
            None => {
                let mut all: Vec<Event> = history.values().flat_map(|ring| ring.iter().cloned()).collect();
                all.sort_by_key(|e| e.timestamp);
                all
            }
        };

        if let Some(since) = filter.since {
            events.retain(|e| e.timestamp >= since);
        }

        if let Some(limit) = filter.limit {
            if events.len() > limit {
                let drop = events.len() - limit;
                events.drain(0..drop);
            }
        }

        events
    }

    /// Number of registered subscriptions, for diagnostics.
    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> EventBus {
        EventBus::new(Arc::new(VirtualClock::new(0)))
    }

    #[tokio::test]
    async fn exact_topic_delivery() {
        let bus = bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        bus.subscribe("ladder.escalated", move |_ev| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish("ladder.escalated", serde_json::json!({"level": 2})).await;
        bus.publish("cache.evicted", serde_json::json!({})).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_receives_every_topic() {
        let bus = bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        bus.subscribe("*", move |_ev| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish("a", serde_json::json!({})).await;
        bus.publish("b", serde_json::json!({})).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscriber_error_does_not_block_others() {
        let bus = bus();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe("x", |_ev| async { Err("boom".to_string()) }).await;
        let c = counter.clone();
        bus.subscribe("x", move |_ev| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish("x", serde_json::json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::with_capacity(Arc::new(VirtualClock::new(0)), 2);
        bus.publish("t", serde_json::json!(1)).await;
        bus.publish("t", serde_json::json!(2)).await;
        bus.publish("t", serde_json::json!(3)).await;

        let hist = bus.history(HistoryFilter::topic("t")).await;
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].payload, serde_json::json!(2));
        assert_eq!(hist[1].payload, serde_json::json!(3));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = bus
            .subscribe("x", move |_ev| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        bus.publish("x", serde_json::json!({})).await;
        handle.unsubscribe().await;
        bus.publish("x", serde_json::json!({})).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_filter_merges_topics_and_applies_since_and_limit() {
        let bus = bus();
        bus.publish("a", serde_json::json!(1)).await;
        bus.publish("b", serde_json::json!(2)).await;
        bus.publish("a", serde_json::json!(3)).await;

        let all = bus.history(HistoryFilter::all()).await;
        assert_eq!(all.len(), 3);

        let limited = bus.history(HistoryFilter::all().limit(2)).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.last().unwrap().payload, serde_json::json!(3));
    }
}
