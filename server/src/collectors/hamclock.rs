//! Propagation source: a local ham-clock service, with a public
//! space-weather API as the last resort.
//!
//! Probes the OpenHamClock port first, then the legacy port, remembers
//! which variant answered, and reads every endpoint through the
//! compatibility layer so both lineages produce the same overlay shape.
//! The overlay (space weather, band conditions, solar terminator) rides
//! alongside the feature stream through a shared cell the aggregator
//! reads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use mesh_model::{validate_coordinates, Feature, Network};

use super::aredn::hostname_id;
use super::{FetchError, Source};
use crate::hamclock_compat::{
    detect_variant, get_endpoint_map, normalize_band_conditions, normalize_de_dx,
    normalize_spacewx, Variant,
};
use crate::util::now_ts;

const OPENHAMCLOCK_PORT: u16 = 8080;
const LEGACY_PORT: u16 = 8081;
const HTTP_DEADLINE: Duration = Duration::from_secs(5);

pub struct HamclockSource {
    host: String,
    fallback_url: String,
    client: reqwest::Client,
    overlay: Arc<Mutex<Map<String, Value>>>,
    variant: Mutex<Variant>,
}

impl HamclockSource {
    pub fn new(host: String, fallback_url: String) -> Self {
        Self {
            host,
            fallback_url,
            client: reqwest::Client::new(),
            overlay: Arc::new(Mutex::new(Map::new())),
            variant: Mutex::new(Variant::Unknown),
        }
    }

    pub fn overlay_handle(&self) -> Arc<Mutex<Map<String, Value>>> {
        self.overlay.clone()
    }

    pub fn variant(&self) -> Variant {
        *self.variant.lock().unwrap()
    }

    async fn get_text(&self, port: u16, path: &str) -> Result<String, FetchError> {
        let url = format!("http://{}:{port}{path}", self.host);
        let response = self
            .client
            .get(&url)
            .timeout(HTTP_DEADLINE)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }

    /// Ham-clock endpoints answer either JSON or `key=value` lines; the
    /// text format is folded into an object here.
    fn parse_doc(body: &str) -> Value {
        if let Ok(v) = serde_json::from_str::<Value>(body) {
            return v;
        }
        let mut obj = Map::new();
        for line in body.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let value = value.trim();
            let parsed = value
                .parse::<f64>()
                .map(|n| json!(n))
                .unwrap_or_else(|_| json!(value));
            obj.insert(key, parsed);
        }
        Value::Object(obj)
    }

    /// Which local port answers the sys probe, and as what variant.
    async fn probe(&self) -> Option<(u16, Variant)> {
        for (port, path) in [
            (OPENHAMCLOCK_PORT, "/api/sys"),
            (LEGACY_PORT, "/get_sys.txt"),
        ] {
            match self.get_text(port, path).await {
                Ok(body) => {
                    let variant = match detect_variant(&body) {
                        Variant::Unknown => Variant::HamClock,
                        v => v,
                    };
                    return Some((port, variant));
                }
                Err(e) => debug!("hamclock: probe {port} failed: {e}"),
            }
        }
        None
    }

    /// Subsolar point for the terminator overlay (approximate solar
    /// declination, minute-level accuracy is plenty for a map shade).
    fn terminator(now: i64) -> Value {
        let day_of_year = ((now / 86_400) % 365) as f64;
        let declination =
            -23.44 * ((2.0 * std::f64::consts::PI / 365.0) * (day_of_year + 10.0)).cos();
        let utc_hours = ((now % 86_400) as f64) / 3600.0;
        let mut subsolar_lon = -15.0 * (utc_hours - 12.0);
        if subsolar_lon <= -180.0 {
            subsolar_lon += 360.0;
        }
        json!({
            "subsolar_lat": declination,
            "subsolar_lon": subsolar_lon,
            "computed_at": now,
        })
    }

    fn station_feature(doc: &Value, kind: &str) -> Option<Feature> {
        let call = doc.get("call").and_then(Value::as_str)?;
        let mut feature = Feature::new(hostname_id(call))
            .with_network(Network::Hamclock)
            .with_property("name", call)
            .with_property("role", kind);
        if let (Some(lat), Some(lon)) = (
            doc.get("lat").and_then(Value::as_f64),
            doc.get("lon").and_then(Value::as_f64),
        ) {
            if let Ok((lat, lon)) = validate_coordinates(lat, lon, false) {
                feature = feature.with_geometry(lat, lon);
            }
        }
        feature.properties.set("last_seen", now_ts());
        Some(feature)
    }

    async fn fetch_local(&self, port: u16, variant: Variant) -> Result<Vec<Feature>, FetchError> {
        let endpoints = get_endpoint_map(variant);

        let spacewx = self
            .get_text(port, endpoints["space_weather"])
            .await
            .map(|b| normalize_spacewx(&Self::parse_doc(&b)))
            .unwrap_or(Value::Null);
        let bands = self
            .get_text(port, endpoints["band_conditions"])
            .await
            .map(|b| normalize_band_conditions(&Self::parse_doc(&b)))
            .unwrap_or(Value::Null);
        let de = self
            .get_text(port, endpoints["de"])
            .await
            .map(|b| normalize_de_dx(&Self::parse_doc(&b)))
            .ok();
        let dx = self
            .get_text(port, endpoints["dx"])
            .await
            .map(|b| normalize_de_dx(&Self::parse_doc(&b)))
            .ok();

        let now = now_ts();
        {
            let mut overlay = self.overlay.lock().unwrap();
            overlay.clear();
            overlay.insert("variant".into(), json!(variant.as_str()));
            overlay.insert("space_weather".into(), spacewx);
            overlay.insert("band_conditions".into(), bands);
            overlay.insert("terminator".into(), Self::terminator(now));
            overlay.insert("updated_at".into(), json!(now));
        }

        let mut features = Vec::new();
        if let Some(f) = de.as_ref().and_then(|d| Self::station_feature(d, "de")) {
            features.push(f);
        }
        if let Some(f) = dx.as_ref().and_then(|d| Self::station_feature(d, "dx")) {
            features.push(f);
        }
        Ok(features)
    }

    /// Public space-weather API: overlay only, no stations.
    async fn fetch_fallback(&self) -> Result<Vec<Feature>, FetchError> {
        let response = self
            .client
            .get(&self.fallback_url)
            .timeout(HTTP_DEADLINE)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let now = now_ts();
        let mut overlay = self.overlay.lock().unwrap();
        overlay.clear();
        overlay.insert("variant".into(), json!("fallback"));
        overlay.insert("space_weather".into(), doc);
        overlay.insert("terminator".into(), Self::terminator(now));
        overlay.insert("updated_at".into(), json!(now));
        Ok(Vec::new())
    }
}

#[async_trait]
impl Source for HamclockSource {
    fn name(&self) -> &'static str {
        "hamclock"
    }

    fn network(&self) -> Network {
        Network::Hamclock
    }

    async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
        if let Some((port, variant)) = self.probe().await {
            *self.variant.lock().unwrap() = variant;
            return self.fetch_local(port, variant).await;
        }
        debug!("hamclock: no local service, using public fallback");
        *self.variant.lock().unwrap() = Variant::Unknown;
        self.fetch_fallback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_text_parses_to_object() {
        let doc = HamclockSource::parse_doc("SFI=142\nKp=3\nCall = W1AW\n# noise\n");
        assert_eq!(doc["SFI"], 142.0);
        assert_eq!(doc["Kp"], 3.0);
        assert_eq!(doc["Call"], "W1AW");
    }

    #[test]
    fn json_body_passes_through() {
        let doc = HamclockSource::parse_doc(r#"{"sfi": 142}"#);
        assert_eq!(doc["sfi"], 142);
    }

    #[test]
    fn station_feature_from_normalized_doc() {
        let de = json!({"call": "W1AW", "lat": 41.7, "lon": -72.7});
        let f = HamclockSource::station_feature(&de, "de").unwrap();
        assert_eq!(f.properties.get_str("name"), Some("W1AW"));
        assert_eq!(f.properties.get_str("role"), Some("de"));
        assert!(f.geometry.is_some());
        assert!(mesh_model::validate_node_id(&f.id).is_ok());
    }

    #[test]
    fn station_without_call_is_skipped() {
        assert!(HamclockSource::station_feature(&json!({"lat": 1.0}), "dx").is_none());
    }

    #[test]
    fn terminator_bounds() {
        for now in [0i64, 1_700_000_000, 1_750_000_000] {
            let t = HamclockSource::terminator(now);
            let lat = t["subsolar_lat"].as_f64().unwrap();
            let lon = t["subsolar_lon"].as_f64().unwrap();
            assert!(lat.abs() <= 23.45);
            assert!((-180.0..=180.0).contains(&lon));
        }
    }
}
