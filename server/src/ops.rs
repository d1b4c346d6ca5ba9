//! # ops
//!
//! Wiring between the ingest plane and the operations layer.
//!
//! Bus callbacks are synchronous, so everything needing async work
//! (history writes, alert delivery, webhook posts) drains through an
//! unbounded channel into a dedicated task. The same task forwards every
//! event to the WebSocket broadcaster as a JSON frame.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mesh_model::Feature;

use crate::aggregator::Aggregator;
use crate::alerts::{AlertEngine, AlertSinks};
use crate::config::Config;
use crate::connectivity::ConnectivityTracker;
use crate::drift::{DriftDetector, TRACKED_FIELDS};
use crate::events::{Event, EventBus, EventType};
use crate::health::HealthScorer;
use crate::history::HistoryStore;
use crate::lifecycle::Shutdown;
use crate::mqtt::BrokerSubscriber;
use crate::store::NodeStore;
use crate::util::now_ts;
use crate::ws::WsBroadcaster;

pub struct OpsDeps {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub store: Arc<NodeStore>,
    pub history: Arc<HistoryStore>,
    pub connectivity: Arc<ConnectivityTracker>,
    pub health: Arc<HealthScorer>,
    pub drift: Arc<DriftDetector>,
    pub alerts: Arc<AlertEngine>,
    pub sinks: Arc<AlertSinks>,
    pub subscriber: Option<Arc<BrokerSubscriber>>,
    pub ws: Option<Arc<WsBroadcaster>>,
}

/// Event → WebSocket frame. Service events collapse onto the shared
/// `{"type":"service",...}` shape; everything else keeps its event name.
pub fn ws_frame(event: &Event) -> Value {
    match event.event_type {
        EventType::ServiceUp | EventType::ServiceDown | EventType::ServiceDegraded => {
            let mut frame = json!({ "type": "service" });
            if let Some(obj) = event.data.as_object() {
                for (k, v) in obj {
                    frame[k] = v.clone();
                }
            }
            frame
        }
        other => {
            let mut frame = json!({ "type": other.as_str(), "ts": event.ts });
            if let Some(obj) = event.data.as_object() {
                for (k, v) in obj {
                    frame[k] = v.clone();
                }
            }
            frame
        }
    }
}

fn drift_fields(feature: &Feature) -> BTreeMap<String, Value> {
    TRACKED_FIELDS
        .iter()
        .filter_map(|&field| feature.properties.get(field).map(|v| (field.to_string(), v.clone())))
        .collect()
}

/// Subscribe the ops task to the bus and spawn it.
pub fn start(deps: Arc<OpsDeps>, shutdown: Shutdown) {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    deps.bus.subscribe(
        None,
        Arc::new(move |event| {
            let _ = tx.send(event.clone());
        }),
    );
    tokio::spawn(event_task(deps, rx, shutdown));
}

async fn event_task(deps: Arc<OpsDeps>, mut rx: mpsc::UnboundedReceiver<Event>, shutdown: Shutdown) {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Some(ws) = &deps.ws {
            ws.broadcast(&ws_frame(&event));
        }

        let node_id = event.data.get("node_id").and_then(Value::as_str).map(str::to_string);
        match event.event_type {
            EventType::NodePosition => {
                if let Some(id) = &node_id {
                    deps.connectivity.record_heartbeat(id, event.ts);
                    let lat = event.data.get("lat").and_then(Value::as_f64);
                    let lon = event.data.get("lon").and_then(Value::as_f64);
                    if let (Some(lat), Some(lon)) = (lat, lon) {
                        let (snr, battery, network) = deps
                            .store
                            .get_node(id)
                            .map(|f| {
                                (
                                    f.properties.get_f64("snr"),
                                    f.properties.get_f64("battery"),
                                    f.network().map(|n| n.as_str()).unwrap_or("meshtastic"),
                                )
                            })
                            .unwrap_or((None, None, "meshtastic"));
                        let result = deps
                            .history
                            .record_observation(id, lat, lon, event.ts, snr, battery, network)
                            .await;
                        if let Err(e) = result {
                            warn!("history write for {id} failed: {e}");
                        }
                    }
                }
            }
            EventType::NodeInfo => {
                if let Some(id) = &node_id {
                    deps.connectivity.record_heartbeat(id, event.ts);
                    if let Some(obj) = event.data.as_object() {
                        let fields: BTreeMap<String, Value> = obj
                            .iter()
                            .filter(|(k, _)| TRACKED_FIELDS.contains(&k.as_str()))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        if !fields.is_empty() {
                            deps.drift.check_node(id, &fields, event.ts);
                        }
                    }
                }
            }
            EventType::NodeTelemetry => {
                if let Some(id) = &node_id {
                    deps.connectivity.record_heartbeat(id, event.ts);
                    // Immediate threshold pass on the fresh metrics
                    if let Some(feature) = deps.store.get_node(id) {
                        let score = deps
                            .health
                            .update(id, &feature.properties, deps.connectivity.state_of(id), event.ts)
                            .map(|r| r.score);
                        let fired =
                            deps.alerts.evaluate_node(id, &feature.properties, score, event.ts);
                        if !fired.is_empty() {
                            let client = deps.subscriber.as_ref().and_then(|s| s.client());
                            deps.sinks.deliver_all(&fired, client.as_ref()).await;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    debug!("ops event task stopped");
}

/// Per-cycle pass over the merged feature set: refresh health scores,
/// evaluate threshold rules, and feed the drift tracker with each node's
/// current radio descriptor.
pub async fn cycle_pass(deps: &OpsDeps, aggregator: &Aggregator) {
    let now = now_ts();
    let features = aggregator.features();
    let client = deps.subscriber.as_ref().and_then(|s| s.client());

    for feature in &features {
        let state = deps.connectivity.state_of(&feature.id);
        let score = deps
            .health
            .update(&feature.id, &feature.properties, state, now)
            .map(|r| r.score);

        let fired = deps.alerts.evaluate_node(&feature.id, &feature.properties, score, now);
        if !fired.is_empty() {
            deps.sinks.deliver_all(&fired, client.as_ref()).await;
        }

        let fields = drift_fields(feature);
        if !fields.is_empty() {
            deps.drift.check_node(&feature.id, &fields, now);
        }
    }
}

/// Offline sweep: connectivity transitions plus absence-based alerts.
pub async fn offline_sweep(deps: &OpsDeps, aggregator: &Aggregator) {
    let now = now_ts();
    let newly_offline = deps.connectivity.check_offline(now);
    if !newly_offline.is_empty() {
        info!("{} nodes went offline", newly_offline.len());
    }

    let threshold = deps.config.alerts.offline_after_secs;
    let client = deps.subscriber.as_ref().and_then(|s| s.client());
    for feature in aggregator.features() {
        let Some(last_seen) = feature.properties.last_seen() else {
            continue;
        };
        if let Some(alert) = deps.alerts.evaluate_offline(&feature.id, last_seen, threshold, now) {
            deps.sinks.deliver(&alert, client.as_ref()).await;
        }
    }
}

/// Daily retention: prune aged observations and drop long-dead nodes.
pub async fn retention_task(deps: Arc<OpsDeps>, shutdown: Shutdown) {
    let horizon = deps.config.history.retention_days.max(1) * 86_400;
    loop {
        match deps.history.prune_old_data(now_ts() - horizon).await {
            Ok(0) => {}
            Ok(removed) => info!("retention: pruned {removed} observations"),
            Err(e) => warn!("retention: prune failed: {e}"),
        }
        deps.store.evict_stale(horizon);
        if !shutdown.sleep(Duration::from_secs(86_400)).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_events_collapse_to_shared_frame() {
        let event = Event::new(
            EventType::ServiceDown,
            json!({"source": "aredn", "state": "down"}),
        );
        let frame = ws_frame(&event);
        assert_eq!(frame["type"], "service");
        assert_eq!(frame["source"], "aredn");
        assert_eq!(frame["state"], "down");
    }

    #[test]
    fn node_events_keep_their_name_and_payload() {
        let event = Event::new(
            EventType::NodePosition,
            json!({"node_id": "aa", "lat": 1.0, "lon": 2.0}),
        );
        let frame = ws_frame(&event);
        assert_eq!(frame["type"], "node.position");
        assert_eq!(frame["node_id"], "aa");
        assert_eq!(frame["lat"], 1.0);
        assert!(frame["ts"].is_i64());
    }

    #[test]
    fn drift_fields_filter_to_tracked_set() {
        let feature = Feature::new("aa")
            .with_property("region", "US")
            .with_property("battery", 50)
            .with_property("role", "ROUTER");
        let fields = drift_fields(&feature);
        assert_eq!(fields.len(), 2);
        assert!(fields.contains_key("region"));
        assert!(!fields.contains_key("battery"));
    }
}
