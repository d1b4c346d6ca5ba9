//! AREDN source: per-node `sysinfo.json` with link-quality-manager data.
//!
//! Every configured endpoint is polled; each answers for itself and its
//! LQM-tracked neighbours. AREDN identifies nodes by hostname, so the
//! stable map id is a 16-hex-digit digest of the lowercased hostname, with
//! the hostname kept in `name`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use mesh_model::{validate_coordinates, Feature, Network, TopologyLink};

use super::{FetchError, Source};
use crate::util::now_ts;

const HTTP_DEADLINE: Duration = Duration::from_secs(8);

/// Stable hex node id from an AREDN hostname.
pub fn hostname_id(hostname: &str) -> String {
    let digest = Sha256::digest(hostname.to_ascii_lowercase().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

pub struct ArednSource {
    endpoints: Vec<String>,
    client: reqwest::Client,
    /// Latest LQM edges, merged by the aggregator into the shared topology.
    topology: Arc<Mutex<Vec<TopologyLink>>>,
}

impl ArednSource {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            client: reqwest::Client::new(),
            topology: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn topology_handle(&self) -> Arc<Mutex<Vec<TopologyLink>>> {
        self.topology.clone()
    }

    /// Parse one sysinfo document into the node's feature plus its
    /// directed LQM edges.
    fn parse_sysinfo(doc: &Value) -> Result<(Vec<Feature>, Vec<TopologyLink>), FetchError> {
        let hostname = doc
            .get("node")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Parse("sysinfo missing node name".into()))?;
        let id = hostname_id(hostname);

        let mut feature = Feature::new(&id)
            .with_network(Network::Aredn)
            .with_property("name", hostname);

        if let (Some(lat), Some(lon)) = (
            doc.get("lat").and_then(parse_coord),
            doc.get("lon").and_then(parse_coord),
        ) {
            if let Ok((lat, lon)) = validate_coordinates(lat, lon, false) {
                feature = feature.with_geometry(lat, lon);
            }
        }
        if let Some(details) = doc.get("node_details") {
            for (from, to) in [
                ("model", "hardware"),
                ("firmware_version", "firmware"),
                ("description", "description"),
            ] {
                if let Some(v) = details.get(from) {
                    if !v.is_null() {
                        feature.properties.set(to, v.clone());
                    }
                }
            }
        }
        feature.properties.set("last_seen", now_ts());
        feature.properties.set("is_online", true);

        let mut features = vec![feature];
        let mut links = Vec::new();

        // link_info: keyed by neighbour IP, carries hostname + linkType
        if let Some(link_info) = doc.get("link_info").and_then(Value::as_object) {
            for link in link_info.values() {
                let Some(peer_host) = link.get("hostname").and_then(Value::as_str) else {
                    continue;
                };
                let peer_host = peer_host.trim_end_matches(".local.mesh");
                let peer_id = hostname_id(peer_host);
                let snr = match (
                    link.get("signal").and_then(Value::as_f64),
                    link.get("noise").and_then(Value::as_f64),
                ) {
                    (Some(signal), Some(noise)) => Some(signal - noise),
                    _ => None,
                };
                let link_type = link
                    .get("linkType")
                    .and_then(Value::as_str)
                    .unwrap_or("RF")
                    .to_string();

                links.push(
                    TopologyLink::new(id.clone(), peer_id.clone(), snr, Network::Aredn)
                        .with_link_type(link_type),
                );

                // The peer is known to exist even before we poll it
                let mut peer = Feature::new(&peer_id)
                    .with_network(Network::Aredn)
                    .with_property("name", peer_host);
                peer.properties.set("last_seen", now_ts());
                features.push(peer);
            }
        }

        Ok((features, links))
    }

    async fn fetch_endpoint(&self, endpoint: &str) -> Result<(Vec<Feature>, Vec<TopologyLink>), FetchError> {
        let url = format!("http://{endpoint}/cgi-bin/sysinfo.json?link_info=1&lqm=1");
        let response = self
            .client
            .get(&url)
            .timeout(HTTP_DEADLINE)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Self::parse_sysinfo(&doc)
    }
}

#[async_trait]
impl Source for ArednSource {
    fn name(&self) -> &'static str {
        "aredn"
    }

    fn network(&self) -> Network {
        Network::Aredn
    }

    async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
        let mut features = Vec::new();
        let mut links = Vec::new();
        let mut last_error = None;

        for endpoint in &self.endpoints {
            match self.fetch_endpoint(endpoint).await {
                Ok((f, l)) => {
                    features.extend(f);
                    links.extend(l);
                }
                Err(e) => {
                    debug!("aredn: {endpoint} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        if features.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
            return Err(FetchError::Unavailable("no aredn endpoints configured".into()));
        }

        *self.topology.lock().unwrap() = links;
        Ok(mesh_model::deduplicate_features(features))
    }
}

fn parse_coord(v: &Value) -> Option<f64> {
    // AREDN firmware reports lat/lon as strings
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}
