//! # store
//!
//! In-memory node store fed by the broker subscriber and read by the
//! Meshtastic collector.
//!
//! One mutex guards the node map, the topology edge map, and the message
//! counters; the eviction callback is always dispatched after that mutex is
//! released so cleanup hooks (health scorer, state tracker, drift detector)
//! can never deadlock against a reader.
//!
//! Capacity is bounded at `max_nodes`; inserting past the cap evicts the
//! node with the oldest `last_seen`. Reads mark nodes stale
//! (`is_online=false`) once `stale_timeout` has passed, and a background
//! sweep may drop very old entries via `evict_stale`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};

use mesh_model::{validate_node_id, Feature, Network, Point, TopologyLink};

use crate::util::now_ts;

pub type RemovedCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
struct NodeRecord {
    feature: Feature,
    last_seen: i64,
}

#[derive(Debug, Clone)]
struct NeighborEdge {
    snr: Option<f64>,
    seen_at: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub edges: usize,
    pub messages_received: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<String, NodeRecord>,
    edges: HashMap<(String, String), NeighborEdge>,
    messages_received: u64,
    evictions: u64,
}

pub struct NodeStore {
    max_nodes: usize,
    stale_timeout: i64,
    inner: Mutex<StoreInner>,
    on_removed: Mutex<Option<RemovedCallback>>,
}

impl NodeStore {
    pub fn new(max_nodes: usize, stale_timeout: i64) -> Self {
        Self {
            max_nodes,
            stale_timeout,
            inner: Mutex::new(StoreInner::default()),
            on_removed: Mutex::new(None),
        }
    }

    /// Install the eviction hook. Called exactly once per evicted node,
    /// outside the store mutex.
    pub fn set_on_removed(&self, cb: RemovedCallback) {
        *self.on_removed.lock().unwrap() = Some(cb);
    }

    fn dispatch_removed(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let cb = self.on_removed.lock().unwrap();
        if let Some(cb) = cb.as_ref() {
            for id in &ids {
                cb(id);
            }
        }
    }

    /// Mutate (or create) one node record. Returns evicted ids to dispatch.
    fn upsert<F>(&self, id: &str, ts: i64, apply: F) -> Vec<String>
    where
        F: FnOnce(&mut Feature),
    {
        let mut inner = self.inner.lock().unwrap();
        inner.messages_received += 1;

        let mut evicted = Vec::new();
        if !inner.nodes.contains_key(id) && inner.nodes.len() >= self.max_nodes {
            // LRU by observation time
            if let Some(oldest) = inner
                .nodes
                .iter()
                .min_by_key(|(_, r)| r.last_seen)
                .map(|(k, _)| k.clone())
            {
                inner.nodes.remove(&oldest);
                inner
                    .edges
                    .retain(|(s, t), _| s != &oldest && t != &oldest);
                inner.evictions += 1;
                evicted.push(oldest);
            }
        }

        let record = inner.nodes.entry(id.to_string()).or_insert_with(|| NodeRecord {
            feature: Feature::new(id).with_network(Network::Meshtastic),
            last_seen: ts,
        });
        record.last_seen = record.last_seen.max(ts);
        record.feature.properties.set("last_seen", record.last_seen);
        apply(&mut record.feature);
        evicted
    }

    pub fn apply_position(
        &self,
        id: &str,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
        ts: i64,
    ) {
        let evicted = self.upsert(id, ts, |f| {
            f.geometry = Some(Point { lat, lon });
            f.properties.set_opt("altitude", altitude);
        });
        self.dispatch_removed(evicted);
    }

    pub fn apply_node_info(&self, id: &str, fields: &Map<String, Value>, ts: i64) {
        let evicted = self.upsert(id, ts, |f| {
            for (k, v) in fields {
                f.properties.set(k, v.clone());
            }
        });
        self.dispatch_removed(evicted);
    }

    pub fn apply_telemetry(&self, id: &str, metrics: &Map<String, Value>, ts: i64) {
        let evicted = self.upsert(id, ts, |f| {
            for (k, v) in metrics {
                f.properties.set(k, v.clone());
            }
        });
        self.dispatch_removed(evicted);
    }

    /// Record directed edges `id → neighbor` with per-edge SNR.
    pub fn apply_neighbors(&self, id: &str, neighbors: &[(String, Option<f64>)], ts: i64) {
        let evicted = self.upsert(id, ts, |_| {});
        {
            let mut inner = self.inner.lock().unwrap();
            for (neighbor, snr) in neighbors {
                inner.edges.insert(
                    (id.to_string(), neighbor.clone()),
                    NeighborEdge { snr: *snr, seen_at: ts },
                );
            }
        }
        self.dispatch_removed(evicted);
    }

    fn online_flag(feature: &mut Feature, last_seen: i64, now: i64, stale_timeout: i64) {
        feature
            .properties
            .set("is_online", now - last_seen <= stale_timeout);
    }

    /// Copy out one node, `!`-prefix and case insensitive.
    pub fn get_node(&self, id: &str) -> Option<Feature> {
        let canonical = validate_node_id(id).ok()?;
        let now = now_ts();
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&canonical).map(|r| {
            let mut f = r.feature.clone();
            Self::online_flag(&mut f, r.last_seen, now, self.stale_timeout);
            f
        })
    }

    /// Copy out every node, stale-marked as of now.
    pub fn features(&self) -> Vec<Feature> {
        let now = now_ts();
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .map(|r| {
                let mut f = r.feature.clone();
                Self::online_flag(&mut f, r.last_seen, now, self.stale_timeout);
                f
            })
            .collect()
    }

    /// Current topology, classified by the shared SNR scale.
    pub fn topology_links(&self) -> Vec<TopologyLink> {
        let inner = self.inner.lock().unwrap();
        inner
            .edges
            .iter()
            .map(|((s, t), e)| TopologyLink::new(s.clone(), t.clone(), e.snr, Network::Meshtastic))
            .collect()
    }

    /// Drop nodes not heard from in `older_than` seconds. Used by the
    /// retention sweep; eviction hooks fire for each dropped node.
    pub fn evict_stale(&self, older_than: i64) {
        let cutoff = now_ts() - older_than;
        let evicted: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            let stale: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, r)| r.last_seen < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for id in &stale {
                inner.nodes.remove(id);
                inner.edges.retain(|(s, t), _| s != id && t != id);
            }
            inner.evictions += stale.len() as u64;
            stale
        };
        self.dispatch_removed(evicted);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        StoreStats {
            nodes: inner.nodes.len(),
            edges: inner.edges.len(),
            messages_received: inner.messages_received,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn position_then_lookup_with_prefix() {
        let store = NodeStore::new(100, 1800);
        store.apply_position("deadbeef", 47.6, -122.3, Some(120.0), now_ts());

        let f = store.get_node("!DEADBEEF").unwrap();
        assert_eq!(f.geometry.unwrap().lat, 47.6);
        assert_eq!(f.properties.get_f64("altitude"), Some(120.0));
        assert_eq!(f.properties.get_bool("is_online"), Some(true));
    }

    #[test]
    fn reader_copy_does_not_mutate_store() {
        let store = NodeStore::new(100, 1800);
        store.apply_position("aa", 1.0, 2.0, None, now_ts());
        let mut copy = store.get_node("aa").unwrap();
        copy.properties.set("name", "tampered");
        assert_eq!(store.get_node("aa").unwrap().properties.get_str("name"), None);
    }

    #[test]
    fn lru_eviction_fires_callback_once() {
        let store = NodeStore::new(2, 1800);
        let removed = Arc::new(AtomicUsize::new(0));
        let r = removed.clone();
        store.set_on_removed(Box::new(move |id| {
            assert_eq!(id, "aa");
            r.fetch_add(1, Ordering::SeqCst);
        }));

        store.apply_position("aa", 1.0, 1.0, None, 100);
        store.apply_position("bb", 1.0, 1.0, None, 200);
        store.apply_position("cc", 1.0, 1.0, None, 300); // evicts aa

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get_node("aa").is_none());
    }

    #[test]
    fn stale_nodes_marked_offline() {
        let store = NodeStore::new(100, 1800);
        store.apply_position("old", 1.0, 1.0, None, now_ts() - 4000);
        store.apply_position("new", 1.0, 1.0, None, now_ts());

        let features = store.features();
        let old = features.iter().find(|f| f.id == "old").unwrap();
        let new = features.iter().find(|f| f.id == "new").unwrap();
        assert_eq!(old.properties.get_bool("is_online"), Some(false));
        assert_eq!(new.properties.get_bool("is_online"), Some(true));
    }

    #[test]
    fn neighbors_become_classified_links() {
        let store = NodeStore::new(100, 1800);
        store.apply_neighbors(
            "aa",
            &[("bb".to_string(), Some(9.0)), ("cc".to_string(), None)],
            now_ts(),
        );
        let links = store.topology_links();
        assert_eq!(links.len(), 2);
        let strong = links.iter().find(|l| l.target == "bb").unwrap();
        assert_eq!(strong.quality, mesh_model::LinkQuality::Excellent);
        let unknown = links.iter().find(|l| l.target == "cc").unwrap();
        assert_eq!(unknown.quality, mesh_model::LinkQuality::Unknown);
    }

    #[test]
    fn evict_stale_prunes_edges_too() {
        let store = NodeStore::new(100, 1800);
        store.apply_position("aa", 1.0, 1.0, None, now_ts() - 90_000);
        store.apply_neighbors("aa", &[("bb".to_string(), Some(1.0))], now_ts() - 90_000);
        store.evict_stale(86_400);
        assert!(store.get_node("aa").is_none());
        assert!(store.topology_links().is_empty());
    }
}
