//! # aggregator
//!
//! Fans out across every enabled collector in parallel, merges the
//! results into the unified feature set, and keeps the latest snapshot
//! behind a lock for the API readers.
//!
//! Merge rules: features concatenate in enable-order and deduplicate by
//! id (first collector wins); topology is the broker store's edges plus
//! the AREDN LQM links; the propagation overlay folds in as
//! collection-level foreign members. Per-source and whole-cycle wall
//! times land in the perf monitor, and source up/down transitions publish
//! `service.*` events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use mesh_model::{deduplicate_features, feature_collection, Feature, Network, TopologyLink};

use crate::collectors::{Collector, CollectorHealth};
use crate::events::{Event, EventBus, EventType};
use crate::perf::PerfMonitor;
use crate::store::NodeStore;
use crate::util::{now_ts, now_ts_f64};

/// A collector never takes longer than this per cycle; a slower one is
/// simply absent until the next read (its cache covers the gap).
const SOURCE_DEADLINE: Duration = Duration::from_secs(45);

#[derive(Default, Clone)]
pub struct AggregatedData {
    pub features: Vec<Feature>,
    pub topology: Vec<TopologyLink>,
    pub overlay: Map<String, Value>,
    pub collected_at: i64,
    pub cycle_seconds: f64,
    pub source_ok: HashMap<String, bool>,
}

pub struct Aggregator {
    collectors: Vec<Arc<Collector>>,
    store: Arc<NodeStore>,
    aredn_topology: Option<Arc<Mutex<Vec<TopologyLink>>>>,
    overlay: Option<Arc<Mutex<Map<String, Value>>>>,
    bus: Arc<EventBus>,
    perf: Arc<PerfMonitor>,
    data: RwLock<AggregatedData>,
    source_up: Mutex<HashMap<String, bool>>,
}

impl Aggregator {
    pub fn new(
        collectors: Vec<Arc<Collector>>,
        store: Arc<NodeStore>,
        aredn_topology: Option<Arc<Mutex<Vec<TopologyLink>>>>,
        overlay: Option<Arc<Mutex<Map<String, Value>>>>,
        bus: Arc<EventBus>,
        perf: Arc<PerfMonitor>,
    ) -> Self {
        Self {
            collectors,
            store,
            aredn_topology,
            overlay,
            bus,
            perf,
            data: RwLock::new(AggregatedData::default()),
            source_up: Mutex::new(HashMap::new()),
        }
    }

    /// One full collection cycle.
    pub async fn collect_all(&self) {
        let cycle_start = now_ts_f64();
        let cycle_start_ts = now_ts();

        let mut handles = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                let start = now_ts_f64();
                let features = collector.collect().await;
                (collector.name(), features, now_ts_f64() - start)
            }));
        }

        // Enable-order is preserved: results land in spawn order
        let mut merged: Vec<Feature> = Vec::new();
        let mut source_ok = HashMap::new();
        for (collector, handle) in self.collectors.iter().zip(handles) {
            match tokio::time::timeout(SOURCE_DEADLINE, handle).await {
                Ok(Ok((name, features, elapsed))) => {
                    self.perf.record(name, elapsed);
                    let health = collector.health_info();
                    let ok = health
                        .last_success_time
                        .map(|t| t >= cycle_start_ts)
                        .unwrap_or(false);
                    source_ok.insert(name.to_string(), ok);
                    debug!("{name}: {} features in {elapsed:.3}s", features.len());
                    merged.extend(features);
                }
                Ok(Err(e)) => {
                    warn!("{}: collection task failed: {e}", collector.name());
                    source_ok.insert(collector.name().to_string(), false);
                }
                Err(_) => {
                    warn!("{}: missed the {SOURCE_DEADLINE:?} cycle deadline", collector.name());
                    source_ok.insert(collector.name().to_string(), false);
                }
            }
        }

        let features = deduplicate_features(merged);

        let mut topology = self.store.topology_links();
        if let Some(links) = &self.aredn_topology {
            topology.extend(links.lock().unwrap().iter().cloned());
        }

        let overlay = self
            .overlay
            .as_ref()
            .map(|cell| cell.lock().unwrap().clone())
            .unwrap_or_default();

        self.publish_transitions(&source_ok);

        let cycle_seconds = now_ts_f64() - cycle_start;
        self.perf.record("all", cycle_seconds);

        let snapshot = AggregatedData {
            features,
            topology,
            overlay,
            collected_at: now_ts(),
            cycle_seconds,
            source_ok,
        };
        *self.data.write().unwrap() = snapshot;
    }

    fn publish_transitions(&self, source_ok: &HashMap<String, bool>) {
        let mut known = self.source_up.lock().unwrap();
        for (name, &ok) in source_ok {
            let previous = known.insert(name.clone(), ok);
            let changed = previous.map(|p| p != ok).unwrap_or(true);
            if !changed {
                continue;
            }
            let event_type = if ok { EventType::ServiceUp } else { EventType::ServiceDown };
            self.bus.publish(Event::new(
                event_type,
                json!({ "source": name, "state": if ok { "up" } else { "down" } }),
            ));
        }
    }

    // ── Readers ───────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> AggregatedData {
        self.data.read().unwrap().clone()
    }

    pub fn features(&self) -> Vec<Feature> {
        self.data.read().unwrap().features.clone()
    }

    /// The unified GeoJSON document, optionally filtered by network. The
    /// overlay rides along as a foreign `overlay_data` member.
    pub fn geojson(&self, network: Option<Network>) -> Value {
        let data = self.data.read().unwrap();
        let filtered: Vec<Feature> = data
            .features
            .iter()
            .filter(|f| network.map(|n| f.network() == Some(n)).unwrap_or(true))
            .cloned()
            .collect();

        let mut foreign = Map::new();
        foreign.insert("collected_at".into(), json!(data.collected_at));
        if network.is_none() && !data.overlay.is_empty() {
            foreign.insert(
                "properties".into(),
                json!({ "overlay_data": Value::Object(data.overlay.clone()) }),
            );
        }
        feature_collection(&filtered, Some(foreign))
    }

    pub fn topology(&self) -> Vec<TopologyLink> {
        self.data.read().unwrap().topology.clone()
    }

    pub fn overlay(&self) -> Map<String, Value> {
        self.data.read().unwrap().overlay.clone()
    }

    pub fn source_status(&self) -> HashMap<String, bool> {
        self.data.read().unwrap().source_ok.clone()
    }

    pub fn collector_health(&self) -> Vec<CollectorHealth> {
        self.collectors.iter().map(|c| c.health_info()).collect()
    }

    pub fn cache_hit_ratios(&self) -> HashMap<String, f64> {
        self.collectors
            .iter()
            .map(|c| (c.name().to_string(), c.cache_hit_ratio()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::collectors::{FetchError, Source};
    use crate::lifecycle::shutdown_pair;
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        features: Vec<Feature>,
    }

    #[async_trait]
    impl Source for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn network(&self) -> Network {
            Network::Meshtastic
        }
        async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
            Ok(self.features.clone())
        }
    }

    fn wrap(name: &'static str, features: Vec<Feature>) -> Arc<Collector> {
        let (ctl, shutdown) = shutdown_pair();
        std::mem::forget(ctl);
        Arc::new(Collector::new(
            Box::new(Fixed { name, features }),
            Arc::new(CircuitBreaker::new(name, 5, 60)),
            shutdown,
        ))
    }

    fn aggregator(collectors: Vec<Arc<Collector>>, bus: Arc<EventBus>) -> Aggregator {
        Aggregator::new(
            collectors,
            Arc::new(NodeStore::new(100, 1800)),
            None,
            None,
            bus,
            Arc::new(PerfMonitor::new()),
        )
    }

    #[tokio::test]
    async fn dedup_prefers_first_collector_in_enable_order() {
        let first = wrap(
            "meshtastic",
            vec![Feature::new("deadbeef")
                .with_geometry(1.0, 2.0)
                .with_property("name", "from-first")],
        );
        let second = wrap(
            "aredn",
            vec![
                Feature::new("deadbeef")
                    .with_geometry(9.0, 9.0)
                    .with_property("name", "from-second"),
                Feature::new("cafe").with_geometry(3.0, 4.0),
            ],
        );
        let agg = aggregator(vec![first, second], Arc::new(EventBus::new()));
        agg.collect_all().await;

        let features = agg.features();
        assert_eq!(features.len(), 2);
        let winner = features.iter().find(|f| f.id == "deadbeef").unwrap();
        assert_eq!(winner.properties.get_str("name"), Some("from-first"));
    }

    #[tokio::test]
    async fn service_transitions_publish_once_per_change() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let bus = Arc::new(EventBus::new());
        let ups = Arc::new(AtomicUsize::new(0));
        let u = ups.clone();
        bus.subscribe(Some(EventType::ServiceUp), Arc::new(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        }));

        let agg = aggregator(vec![wrap("meshtastic", vec![Feature::new("aa")])], bus);
        agg.collect_all().await;
        agg.collect_all().await;
        // First cycle transitions to up; second is steady-state
        assert_eq!(ups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn geojson_filters_by_network() {
        let mixed = wrap(
            "meshtastic",
            vec![
                Feature::new("aa").with_geometry(1.0, 1.0).with_network(Network::Meshtastic),
                Feature::new("bb").with_geometry(2.0, 2.0).with_network(Network::Aredn),
            ],
        );
        let agg = aggregator(vec![mixed], Arc::new(EventBus::new()));
        agg.collect_all().await;

        let all = agg.geojson(None);
        assert_eq!(all["features"].as_array().unwrap().len(), 2);
        let aredn_only = agg.geojson(Some(Network::Aredn));
        let features = aredn_only["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["id"], "bb");
    }
}
