//! # events
//!
//! Synchronous, thread-safe pub/sub connecting the ingest plane to the
//! operations layer and the delivery plane.
//!
//! Subscribers register a callback for one event type or for every type
//! (wildcard). `publish()` invokes each matching callback behind a panic
//! shield: a failing subscriber is logged and counted but never blocks
//! delivery to the others and never propagates to the publisher.
//!
//! Callbacks run on the publisher's thread; anything that needs to do async
//! work bridges through a channel (see the ops wiring in `main.rs`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::util::now_ts;

// ── Event types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    NodePosition,
    NodeInfo,
    NodeTelemetry,
    NodeTopology,
    ServiceUp,
    ServiceDown,
    ServiceDegraded,
    AlertFired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodePosition => "node.position",
            EventType::NodeInfo => "node.info",
            EventType::NodeTelemetry => "node.telemetry",
            EventType::NodeTopology => "node.topology",
            EventType::ServiceUp => "service.up",
            EventType::ServiceDown => "service.down",
            EventType::ServiceDegraded => "service.degraded",
            EventType::AlertFired => "alert.fired",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type", serialize_with = "serialize_type")]
    pub event_type: EventType,
    #[serde(flatten)]
    pub data: Value,
    pub ts: i64,
}

fn serialize_type<S: serde::Serializer>(t: &EventType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(t.as_str())
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data, ts: now_ts() }
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_errors: u64,
}

struct Subscriber {
    id: u64,
    /// None subscribes to every event type.
    filter: Option<EventType>,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
    // Stats live behind their own mutex and are mutated in place so
    // concurrent publishers always observe the same instance.
    stats: Mutex<BusStats>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            stats: Mutex::new(BusStats::default()),
        }
    }

    /// Subscribe to one event type, or to all of them with `filter = None`.
    /// Returns a token for `unsubscribe`.
    pub fn subscribe(&self, filter: Option<EventType>, callback: Callback) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber { id, filter, callback });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.retain(|s| s.id != id);
    }

    /// Deliver `event` to every matching subscriber. The subscriber list is
    /// snapshotted once per call, so subscribing or unsubscribing from
    /// inside a callback affects the next publish, not this one.
    pub fn publish(&self, event: Event) {
        let matching: Vec<Callback> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(event.event_type))
                .map(|s| s.callback.clone())
                .collect()
        };

        self.stats.lock().unwrap().total_published += 1;

        for cb in matching {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&event)));
            let mut stats = self.stats.lock().unwrap();
            match result {
                Ok(()) => stats.total_delivered += 1,
                Err(_) => {
                    stats.total_errors += 1;
                    drop(stats);
                    tracing::error!("event bus: subscriber panicked handling {}", event.event_type.as_str());
                }
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        self.stats.lock().unwrap().clone()
    }

    /// Drop all subscribers. Stats counters are preserved (mutated in
    /// place, never replaced) so long-lived readers keep a consistent view.
    pub fn reset(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    pub fn reset_stats(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_published = 0;
        stats.total_delivered = 0;
        stats.total_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wildcard_and_typed_delivery() {
        let bus = EventBus::new();
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let t = typed.clone();
        bus.subscribe(Some(EventType::NodePosition), Arc::new(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        let a = all.clone();
        bus.subscribe(None, Arc::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Event::new(EventType::NodePosition, json!({"node_id": "aa"})));
        bus.publish(Event::new(EventType::NodeInfo, json!({"node_id": "aa"})));

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(None, Arc::new(|_| panic!("bad subscriber")));
        let d = delivered.clone();
        bus.subscribe(None, Arc::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Event::new(EventType::AlertFired, json!({})));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.total_delivered, 1);
    }

    #[test]
    fn reset_clears_subscribers_but_keeps_stats() {
        let bus = EventBus::new();
        bus.subscribe(None, Arc::new(|_| {}));
        bus.publish(Event::new(EventType::ServiceUp, json!({"source": "aredn"})));
        assert_eq!(bus.stats().total_published, 1);

        bus.reset();
        bus.publish(Event::new(EventType::ServiceUp, json!({"source": "aredn"})));
        let stats = bus.stats();
        assert_eq!(stats.total_published, 2);
        assert_eq!(stats.total_delivered, 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(None, Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        bus.publish(Event::new(EventType::NodeTelemetry, json!({})));
        bus.unsubscribe(id);
        bus.publish(Event::new(EventType::NodeTelemetry, json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
