//! # mqtt
//!
//! Live broker subscriber.
//!
//! Maintains a session to the mesh broker, subscribes to the JSON topic
//! tree, and turns decoded envelopes into node-store writes plus typed bus
//! events. Binary protobuf envelopes are decoded upstream by the broker's
//! JSON bridge; this side only ever sees the logical fields.
//!
//! The connection loop runs as its own task: on any transport error it
//! tears the session down and redials under the broker reconnect preset
//! (2 s → 120 s, unbounded), logging the attempt number as it goes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use mesh_model::{validate_coordinates, validate_node_id};

use crate::backoff::ReconnectStrategy;
use crate::config::MqttConfig;
use crate::events::{Event, EventBus, EventType};
use crate::lifecycle::Shutdown;
use crate::store::NodeStore;
use crate::util::now_ts;

#[derive(Default)]
struct SubscriberStats {
    connect_attempts: u64,
    messages_received: u64,
    decode_errors: u64,
    position: u64,
    nodeinfo: u64,
    telemetry: u64,
    neighborinfo: u64,
    last_message_time: Option<i64>,
}

pub struct BrokerSubscriber {
    config: MqttConfig,
    store: Arc<NodeStore>,
    bus: Arc<EventBus>,
    stats: Mutex<SubscriberStats>,
    connected: AtomicBool,
    client: Mutex<Option<AsyncClient>>,
}

impl BrokerSubscriber {
    pub fn new(config: MqttConfig, store: Arc<NodeStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            bus,
            stats: Mutex::new(SubscriberStats::default()),
            connected: AtomicBool::new(false),
            client: Mutex::new(None),
        })
    }

    /// Client handle for alert publication; present while a session is up.
    pub fn client(&self) -> Option<AsyncClient> {
        self.client.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Value {
        let stats = self.stats.lock().unwrap();
        json!({
            "connected": self.is_connected(),
            "connect_attempts": stats.connect_attempts,
            "messages_received": stats.messages_received,
            "decode_errors": stats.decode_errors,
            "by_type": {
                "position": stats.position,
                "nodeinfo": stats.nodeinfo,
                "telemetry": stats.telemetry,
                "neighborinfo": stats.neighborinfo,
            },
            "last_message_time": stats.last_message_time,
        })
    }

    /// Connection/receive loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let reconnect = ReconnectStrategy::broker();
        loop {
            if shutdown.is_signalled() {
                break;
            }

            let attempt = {
                let mut stats = self.stats.lock().unwrap();
                stats.connect_attempts += 1;
                stats.connect_attempts
            };
            info!(
                "mqtt: connecting to {}:{} (attempt {attempt})",
                self.config.host, self.config.port
            );

            let mut options = MqttOptions::new(
                format!("meshforge-maps-{}", std::process::id()),
                &self.config.host,
                self.config.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
                options.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut eventloop) = AsyncClient::new(options, 64);
            *self.client.lock().unwrap() = Some(client.clone());

            let topic = format!("{}/2/json/#", self.config.topic_prefix);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        let _ = client.disconnect().await;
                        self.connected.store(false, Ordering::Relaxed);
                        return;
                    }
                    event = eventloop.poll() => match event {
                        Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                            info!("mqtt: connected, subscribing to {topic}");
                            self.connected.store(true, Ordering::Relaxed);
                            reconnect.reset();
                            if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                                warn!("mqtt: subscribe failed: {e}");
                            }
                        }
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            self.handle_payload(&publish.payload);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("mqtt: connection lost: {e}");
                            self.connected.store(false, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }

            *self.client.lock().unwrap() = None;
            let delay = reconnect.next_delay();
            debug!("mqtt: redialing in {delay:?}");
            if !shutdown.sleep(delay).await {
                break;
            }
        }
    }

    fn handle_payload(&self, payload: &[u8]) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.messages_received += 1;
            stats.last_message_time = Some(now_ts());
        }
        match serde_json::from_slice::<Value>(payload) {
            Ok(envelope) => self.handle_envelope(&envelope),
            Err(e) => {
                self.stats.lock().unwrap().decode_errors += 1;
                debug!("mqtt: undecodable payload: {e}");
            }
        }
    }

    /// Apply one decoded envelope to the store and publish its event.
    /// Split out from the wire path so tests can drive it directly.
    pub fn handle_envelope(&self, envelope: &Value) {
        let Some(node_id) = envelope_sender(envelope) else {
            self.stats.lock().unwrap().decode_errors += 1;
            return;
        };
        let ts = envelope
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(now_ts);
        let payload = envelope.get("payload").unwrap_or(&Value::Null);

        match envelope.get("type").and_then(Value::as_str) {
            Some("position") => self.on_position(&node_id, payload, ts),
            Some("nodeinfo") => self.on_nodeinfo(&node_id, payload, ts),
            Some("telemetry") => self.on_telemetry(&node_id, payload, ts),
            Some("neighborinfo") => self.on_neighborinfo(&node_id, payload, ts),
            _ => {}
        }
    }

    fn on_position(&self, node_id: &str, payload: &Value, ts: i64) {
        let coords = match (
            payload.get("latitude_i").and_then(Value::as_f64),
            payload.get("longitude_i").and_then(Value::as_f64),
        ) {
            (Some(lat), Some(lon)) => validate_coordinates(lat, lon, true),
            _ => match (
                payload.get("latitude").and_then(Value::as_f64),
                payload.get("longitude").and_then(Value::as_f64),
            ) {
                (Some(lat), Some(lon)) => validate_coordinates(lat, lon, false),
                _ => return,
            },
        };
        let Ok((lat, lon)) = coords else {
            // Null Island and malformed fixes stop here: no store write,
            // no event
            debug!("mqtt: rejected position for {node_id}: {coords:?}");
            return;
        };
        let altitude = payload.get("altitude").and_then(Value::as_f64);

        self.stats.lock().unwrap().position += 1;
        self.store.apply_position(node_id, lat, lon, altitude, ts);
        self.bus.publish(Event::new(
            EventType::NodePosition,
            json!({
                "node_id": node_id,
                "network": "meshtastic",
                "lat": lat,
                "lon": lon,
                "altitude": altitude,
            }),
        ));
    }

    fn on_nodeinfo(&self, node_id: &str, payload: &Value, ts: i64) {
        let mut fields = Map::new();
        for (from, to) in [
            ("longname", "name"),
            ("shortname", "short_name"),
            ("hardware", "hardware"),
            ("role", "role"),
            ("region", "region"),
            ("modem_preset", "modem_preset"),
            ("channel_name", "channel_name"),
            ("hop_limit", "hop_limit"),
            ("tx_power", "tx_power"),
            ("firmware", "firmware"),
        ] {
            if let Some(v) = payload.get(from) {
                if !v.is_null() {
                    fields.insert(to.to_string(), v.clone());
                }
            }
        }
        if fields.is_empty() {
            return;
        }

        self.stats.lock().unwrap().nodeinfo += 1;
        self.store.apply_node_info(node_id, &fields, ts);
        let mut data = fields;
        data.insert("node_id".into(), json!(node_id));
        data.insert("network".into(), json!("meshtastic"));
        self.bus
            .publish(Event::new(EventType::NodeInfo, Value::Object(data)));
    }

    fn on_telemetry(&self, node_id: &str, payload: &Value, ts: i64) {
        let mut metrics = Map::new();
        for (from, to) in [
            ("battery_level", "battery"),
            ("voltage", "voltage"),
            ("channel_utilization", "channel_util"),
            ("air_util_tx", "air_util_tx"),
            ("temperature", "temperature"),
            ("relative_humidity", "humidity"),
            ("barometric_pressure", "pressure"),
            ("iaq", "iaq"),
            ("pm25", "pm25"),
            ("co2", "co2"),
            ("voc", "voc"),
            ("nox", "nox"),
            ("heart_bpm", "heart_bpm"),
            ("spo2", "spo2"),
            ("body_temperature", "body_temperature"),
        ] {
            if let Some(v) = payload.get(from) {
                if v.is_number() {
                    metrics.insert(to.to_string(), v.clone());
                }
            }
        }
        if metrics.is_empty() {
            return;
        }

        self.stats.lock().unwrap().telemetry += 1;
        self.store.apply_telemetry(node_id, &metrics, ts);
        self.bus.publish(Event::new(
            EventType::NodeTelemetry,
            json!({
                "node_id": node_id,
                "network": "meshtastic",
                "metrics": metrics,
            }),
        ));
    }

    fn on_neighborinfo(&self, node_id: &str, payload: &Value, ts: i64) {
        let Some(raw) = payload.get("neighbors").and_then(Value::as_array) else {
            return;
        };
        let neighbors: Vec<(String, Option<f64>)> = raw
            .iter()
            .filter_map(|n| {
                let id = n
                    .get("node_id")
                    .and_then(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .or_else(|| v.as_u64().map(|num| format!("{num:08x}")))
                    })
                    .and_then(|s| validate_node_id(&s).ok())?;
                Some((id, n.get("snr").and_then(Value::as_f64)))
            })
            .collect();
        if neighbors.is_empty() {
            return;
        }

        self.stats.lock().unwrap().neighborinfo += 1;
        self.store.apply_neighbors(node_id, &neighbors, ts);
        self.bus.publish(Event::new(
            EventType::NodeTopology,
            json!({
                "node_id": node_id,
                "network": "meshtastic",
                "neighbors": neighbors
                    .iter()
                    .map(|(id, snr)| json!({"node_id": id, "snr": snr}))
                    .collect::<Vec<_>>(),
            }),
        ));
    }
}

/// Canonical sender id from an envelope: the `sender` string when present,
/// otherwise the numeric `from` rendered as hex.
fn envelope_sender(envelope: &Value) -> Option<String> {
    if let Some(sender) = envelope.get("sender").and_then(Value::as_str) {
        if let Ok(id) = validate_node_id(sender) {
            return Some(id);
        }
    }
    envelope
        .get("from")
        .and_then(Value::as_u64)
        .and_then(|n| validate_node_id(&format!("{n:08x}")).ok())
}
