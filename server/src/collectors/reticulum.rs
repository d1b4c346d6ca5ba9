//! Reticulum source: local diagnostic process with layered disk-cache
//! fallback.
//!
//! `rnstatus --json` is invoked as an argument vector (never through a
//! shell) with a hard 10 s deadline. A good run refreshes the collector's
//! disk cache; a bad one falls back to that cache, then to the
//! aggregator-wide cache written by previous server generations.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use mesh_model::{validate_node_id, Feature, Network};

use super::{FetchError, Source};
use crate::util::now_ts;

const SUBPROCESS_DEADLINE: Duration = Duration::from_secs(10);

pub struct ReticulumSource {
    status_cmd: String,
    cache_file: PathBuf,
    shared_cache_file: PathBuf,
}

impl ReticulumSource {
    pub fn new(status_cmd: String, cache_dir: &std::path::Path) -> Self {
        Self {
            status_cmd,
            cache_file: cache_dir.join("reticulum_nodes.json"),
            shared_cache_file: cache_dir.join("aggregator_cache.json"),
        }
    }

    /// Path-table entries are identified by destination hash; they carry
    /// no geolocation.
    fn doc_to_features(doc: &Value) -> Result<Vec<Feature>, FetchError> {
        let entries = doc
            .get("paths")
            .or_else(|| doc.get("destinations"))
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Parse("no paths/destinations array".into()))?;

        let mut features = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(raw_hash) = entry.get("hash").and_then(Value::as_str) else {
                continue;
            };
            // Destination hashes are long hex; the node id keeps the
            // leading 16 digits
            let short: String = raw_hash.chars().filter(|c| c.is_ascii_hexdigit()).take(16).collect();
            let Ok(id) = validate_node_id(&short) else {
                continue;
            };

            let mut feature = Feature::new(&id).with_network(Network::Reticulum);
            feature.properties.set("description", format!("rns:{raw_hash}"));
            if let Some(hops) = entry.get("hops").and_then(Value::as_i64) {
                feature.properties.set("hops_away", hops.clamp(0, 7));
            }
            if let Some(iface) = entry.get("interface").and_then(Value::as_str) {
                feature.properties.set("via", iface);
            }
            let ts = entry
                .get("last_heard")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ts);
            feature.properties.set("last_seen", ts);
            features.push(feature);
        }
        Ok(features)
    }

    async fn run_status_process(&self) -> Result<Vec<Feature>, FetchError> {
        let output = tokio::time::timeout(
            SUBPROCESS_DEADLINE,
            Command::new(&self.status_cmd)
                .arg("--json")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| FetchError::Transport(format!("{} timed out", self.status_cmd)))?
        .map_err(|e| FetchError::Transport(format!("{}: {e}", self.status_cmd)))?;

        if !output.status.success() {
            return Err(FetchError::Transport(format!(
                "{} exited with {}",
                self.status_cmd, output.status
            )));
        }

        let doc: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Self::doc_to_features(&doc)
    }

    fn read_cache(&self, path: &std::path::Path) -> Option<Vec<Feature>> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn write_cache(&self, features: &[Feature]) {
        if let Some(parent) = self.cache_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(features) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.cache_file, body) {
                    warn!("reticulum: cache write failed: {e}");
                }
            }
            Err(e) => warn!("reticulum: cache serialize failed: {e}"),
        }
    }
}

#[async_trait]
impl Source for ReticulumSource {
    fn name(&self) -> &'static str {
        "reticulum"
    }

    fn network(&self) -> Network {
        Network::Reticulum
    }

    async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
        match self.run_status_process().await {
            Ok(features) => {
                self.write_cache(&features);
                Ok(features)
            }
            Err(e) => {
                debug!("reticulum: status process failed ({e}), trying disk caches");
                if let Some(cached) = self.read_cache(&self.cache_file) {
                    return Ok(cached);
                }
                if let Some(cached) = self.read_cache(&self.shared_cache_file) {
                    return Ok(cached);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_table_maps_to_features() {
        let doc = json!({
            "paths": [
                {"hash": "a9b1c2d3e4f5a6b7c8d9", "hops": 3, "interface": "TCPInterface[home]"},
                {"hash": "ZZZ", "hops": 1},
                {"no_hash": true},
            ]
        });
        let features = ReticulumSource::doc_to_features(&doc).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, "a9b1c2d3e4f5a6b7");
        assert_eq!(features[0].properties.get_i64("hops_away"), Some(3));
        assert!(features[0].geometry.is_none());
    }

    #[test]
    fn hop_count_is_clamped_to_path_limit() {
        let doc = json!({"destinations": [{"hash": "abcd", "hops": 30}]});
        let features = ReticulumSource::doc_to_features(&doc).unwrap();
        assert_eq!(features[0].properties.get_i64("hops_away"), Some(7));
    }

    #[test]
    fn missing_table_is_parse_error() {
        let doc = json!({"interfaces": []});
        assert!(matches!(
            ReticulumSource::doc_to_features(&doc),
            Err(FetchError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn falls_back_to_disk_cache_when_process_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = ReticulumSource::new("definitely-not-a-command".into(), dir.path());

        let cached = vec![Feature::new("cafe").with_network(Network::Reticulum)];
        std::fs::write(
            dir.path().join("reticulum_nodes.json"),
            serde_json::to_string(&cached).unwrap(),
        )
        .unwrap();

        let features = source.fetch().await.unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, "cafe");
    }

    #[tokio::test]
    async fn no_process_and_no_cache_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ReticulumSource::new("definitely-not-a-command".into(), dir.path());
        assert!(matches!(
            source.fetch().await,
            Err(FetchError::Transport(_))
        ));
    }
}
