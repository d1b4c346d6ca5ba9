//! Meshtastic source: the live broker store first, the node's local HTTP
//! API as a cold-start fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use mesh_model::{validate_coordinates, validate_node_id, Feature, Network};

use super::{FetchError, Source};
use crate::leases::LeaseManager;
use crate::store::NodeStore;
use crate::util::now_ts;

/// How long we will wait for the radio lease before giving up the cycle.
const LEASE_TIMEOUT: Duration = Duration::from_secs(6);

pub struct MeshtasticSource {
    store: Arc<NodeStore>,
    api_url: Option<String>,
    client: reqwest::Client,
    leases: Arc<LeaseManager>,
}

impl MeshtasticSource {
    pub fn new(store: Arc<NodeStore>, api_url: Option<String>, leases: Arc<LeaseManager>) -> Self {
        Self {
            store,
            api_url,
            client: reqwest::Client::new(),
            leases,
        }
    }

    fn lease_name(url: &str) -> String {
        // host:port key; falls back to the raw URL for odd inputs
        url.trim_start_matches("http://")
            .trim_start_matches("https://")
            .split('/')
            .next()
            .unwrap_or(url)
            .to_string()
    }

    /// Map one node document from the local API onto a Feature. Integer
    /// 1e7-scaled coordinates are accepted alongside floats.
    fn node_to_feature(doc: &Value) -> Option<Feature> {
        let raw_id = doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| doc.get("num").and_then(Value::as_u64).map(|n| format!("{n:08x}")))?;
        let id = validate_node_id(&raw_id).ok()?;

        let mut feature = Feature::new(&id).with_network(Network::Meshtastic);

        let coords = match (
            doc.get("latitude").and_then(Value::as_f64),
            doc.get("longitude").and_then(Value::as_f64),
        ) {
            (Some(lat), Some(lon)) => validate_coordinates(lat, lon, false).ok(),
            _ => match (
                doc.get("latitude_i").and_then(Value::as_f64),
                doc.get("longitude_i").and_then(Value::as_f64),
            ) {
                (Some(lat), Some(lon)) => validate_coordinates(lat, lon, true).ok(),
                _ => None,
            },
        };
        if let Some((lat, lon)) = coords {
            feature = feature.with_geometry(lat, lon);
        }

        for (from, to) in [
            ("long_name", "name"),
            ("longName", "name"),
            ("short_name", "short_name"),
            ("shortName", "short_name"),
            ("hw_model", "hardware"),
            ("hwModel", "hardware"),
            ("role", "role"),
            ("battery_level", "battery"),
            ("voltage", "voltage"),
            ("snr", "snr"),
            ("hops_away", "hops_away"),
            ("altitude", "altitude"),
            ("last_heard", "last_seen"),
            ("lastHeard", "last_seen"),
        ] {
            if let Some(v) = doc.get(from) {
                if !v.is_null() {
                    feature.properties.set(to, v.clone());
                }
            }
        }
        if feature.properties.last_seen().is_none() {
            feature.properties.set("last_seen", now_ts());
        }
        Some(feature)
    }

    async fn fetch_local_api(&self, url: &str) -> Result<Vec<Feature>, FetchError> {
        // Single holder per radio host; the HTTP deadline sits one second
        // inside the lease timeout so the lease always outlives the call
        let lease = self
            .leases
            .acquire(&Self::lease_name(url), "meshtastic-collector", LEASE_TIMEOUT)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let endpoint = format!("{}/api/v1/nodes", url.trim_end_matches('/'));
        let response = self
            .client
            .get(&endpoint)
            .timeout(LEASE_TIMEOUT - Duration::from_secs(1))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        drop(lease);

        let nodes = body
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Parse("missing nodes array".into()))?;
        Ok(nodes.iter().filter_map(Self::node_to_feature).collect())
    }
}

#[async_trait]
impl Source for MeshtasticSource {
    fn name(&self) -> &'static str {
        "meshtastic"
    }

    fn network(&self) -> Network {
        Network::Meshtastic
    }

    async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
        // Normal path: the broker subscriber keeps the store current
        if !self.store.is_empty() {
            return Ok(self.store.features());
        }

        let Some(url) = &self.api_url else {
            return Ok(Vec::new());
        };

        // Cold start: one retry on transient transport errors, none on
        // parse errors
        match self.fetch_local_api(url).await {
            Ok(features) => Ok(features),
            Err(e @ FetchError::Parse(_)) => Err(e),
            Err(_) => self.fetch_local_api(url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_document_mapping() {
        let doc = json!({
            "id": "!DeadBeef",
            "longName": "Ridge Repeater",
            "shortName": "RDG",
            "hwModel": "TBEAM",
            "latitude_i": 476062000i64,
            "longitude_i": -1223321000i64,
            "battery_level": 92,
            "snr": 6.5,
        });
        let f = MeshtasticSource::node_to_feature(&doc).unwrap();
        assert_eq!(f.id, "deadbeef");
        let p = f.geometry.unwrap();
        assert!((p.lat - 47.6062).abs() < 1e-6);
        assert_eq!(f.properties.get_str("name"), Some("Ridge Repeater"));
        assert_eq!(f.properties.get_str("hardware"), Some("TBEAM"));
        assert_eq!(f.properties.get_f64("battery"), Some(92.0));
    }

    #[test]
    fn numeric_node_number_becomes_hex_id() {
        let doc = json!({"num": 305419896u64, "snr": 1.0});
        let f = MeshtasticSource::node_to_feature(&doc).unwrap();
        assert_eq!(f.id, "12345678");
        assert!(f.geometry.is_none());
    }

    #[test]
    fn null_island_positions_are_dropped_not_fatal() {
        let doc = json!({"id": "abcd", "latitude": 0.0, "longitude": 0.0});
        let f = MeshtasticSource::node_to_feature(&doc).unwrap();
        assert!(f.geometry.is_none());
    }

    #[test]
    fn invalid_id_rejects_node() {
        let doc = json!({"id": "not-hex!"});
        assert!(MeshtasticSource::node_to_feature(&doc).is_none());
    }

    #[tokio::test]
    async fn store_backed_fetch_never_touches_http() {
        let store = Arc::new(NodeStore::new(100, 1800));
        store.apply_position("aa", 10.0, 20.0, None, now_ts());
        let source = MeshtasticSource::new(store, None, Arc::new(LeaseManager::new()));
        let features = source.fetch().await.unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, "aa");
    }

    #[tokio::test]
    async fn empty_store_without_api_is_empty_not_error() {
        let store = Arc::new(NodeStore::new(100, 1800));
        let source = MeshtasticSource::new(store, None, Arc::new(LeaseManager::new()));
        assert!(source.fetch().await.unwrap().is_empty());
    }
}
