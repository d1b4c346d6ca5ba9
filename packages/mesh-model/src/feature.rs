//! The unified node record.
//!
//! Every collector and every store in the server produces and consumes
//! [`Feature`]. On the wire it is a GeoJSON Feature object:
//!
//! ```json
//! {
//!   "type": "Feature",
//!   "id": "deadbeef",
//!   "geometry": { "type": "Point", "coordinates": [lon, lat] },
//!   "properties": { "network": "meshtastic", "battery": 87, ... }
//! }
//! ```
//!
//! The property bag is an ordered `serde_json::Map`: recognized keys have
//! typed accessors below, unknown keys ride through serialization untouched
//! so upstream extensions survive the round trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Source network tag ────────────────────────────────────────────────────────

/// Which mesh ecosystem a node was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Meshtastic,
    Reticulum,
    Aredn,
    Hamclock,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Meshtastic => "meshtastic",
            Network::Reticulum => "reticulum",
            Network::Aredn => "aredn",
            Network::Hamclock => "hamclock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "meshtastic" => Some(Network::Meshtastic),
            "reticulum" => Some(Network::Reticulum),
            "aredn" => Some(Network::Aredn),
            "hamclock" => Some(Network::Hamclock),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// A WGS84 point. Stored lat/lon, serialized in GeoJSON `[lon, lat]` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

// ── Property bag ──────────────────────────────────────────────────────────────

/// Typed view over the node property map. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(pub Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Insert only when the value is present; keeps "missing" distinct
    /// from null/zero in the serialized bag.
    pub fn set_opt(&mut self, key: &str, value: Option<impl Into<Value>>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn network(&self) -> Option<Network> {
        self.get_str("network").and_then(Network::parse)
    }

    pub fn set_network(&mut self, network: Network) {
        self.set("network", network.as_str());
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.get_i64("last_seen")
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Merge `other` into self, overwriting existing keys.
    pub fn merge(&mut self, other: &Properties) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

// ── Feature ───────────────────────────────────────────────────────────────────

/// GeoJSON wire shape (serde helper; `Feature` converts through it).
#[derive(Serialize, Deserialize)]
struct GeoJsonFeature {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    geometry: Option<GeoJsonPoint>,
    properties: Properties,
}

#[derive(Serialize, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type")]
    kind: String,
    /// `[lon, lat]` per RFC 7946
    coordinates: [f64; 2],
}

/// One node as observed by some source.
///
/// Non-geolocated nodes carry `geometry: None`; the store accepts them but
/// GeoJSON node responses filter them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "GeoJsonFeature", try_from = "GeoJsonFeature")]
pub struct Feature {
    pub id: String,
    pub geometry: Option<Point>,
    pub properties: Properties,
}

impl Feature {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            geometry: None,
            properties: Properties::new(),
        }
    }

    pub fn with_geometry(mut self, lat: f64, lon: f64) -> Self {
        self.geometry = Some(Point { lat, lon });
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.properties.set_network(network);
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn network(&self) -> Option<Network> {
        self.properties.network()
    }

    pub fn to_geojson(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Feature> for GeoJsonFeature {
    fn from(f: Feature) -> Self {
        GeoJsonFeature {
            kind: "Feature".to_string(),
            id: f.id,
            geometry: f.geometry.map(|p| GeoJsonPoint {
                kind: "Point".to_string(),
                coordinates: [p.lon, p.lat],
            }),
            properties: f.properties,
        }
    }
}

impl TryFrom<GeoJsonFeature> for Feature {
    type Error = String;

    fn try_from(raw: GeoJsonFeature) -> Result<Self, Self::Error> {
        if raw.kind != "Feature" {
            return Err(format!("expected GeoJSON Feature, got {:?}", raw.kind));
        }
        let geometry = match raw.geometry {
            Some(g) if g.kind == "Point" => Some(Point {
                lon: g.coordinates[0],
                lat: g.coordinates[1],
            }),
            Some(g) => return Err(format!("unsupported geometry type {:?}", g.kind)),
            None => None,
        };
        Ok(Feature {
            id: raw.id,
            geometry,
            properties: raw.properties,
        })
    }
}

/// Wrap features into a GeoJSON FeatureCollection, dropping non-geolocated
/// nodes. Collection-level extras (overlay data, timings) go in `foreign`.
pub fn feature_collection(features: &[Feature], foreign: Option<Map<String, Value>>) -> Value {
    let members: Vec<Value> = features
        .iter()
        .filter(|f| f.geometry.is_some())
        .map(Feature::to_geojson)
        .collect();

    let mut doc = Map::new();
    doc.insert("type".into(), Value::String("FeatureCollection".into()));
    doc.insert("features".into(), Value::Array(members));
    if let Some(extra) = foreign {
        for (k, v) in extra {
            doc.insert(k, v);
        }
    }
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geojson_round_trip_preserves_fields() {
        let f = Feature::new("deadbeef")
            .with_geometry(47.6, -122.3)
            .with_network(Network::Meshtastic)
            .with_property("name", "Base Camp")
            .with_property("battery", 0)
            .with_property("snr", -7.25)
            .with_property("x_custom_key", "pass-through");

        let json = serde_json::to_string(&f).unwrap();
        let back: Feature = serde_json::from_str(&json).unwrap();

        assert_eq!(back, f);
        // Numeric zero survives as a real value, not "missing"
        assert_eq!(back.properties.get_f64("battery"), Some(0.0));
        // Unknown keys ride through
        assert_eq!(back.properties.get_str("x_custom_key"), Some("pass-through"));
    }

    #[test]
    fn geometry_serializes_lon_lat_order() {
        let f = Feature::new("ab").with_geometry(10.0, 20.0);
        let v = f.to_geojson();
        assert_eq!(v["geometry"]["coordinates"][0], 20.0);
        assert_eq!(v["geometry"]["coordinates"][1], 10.0);
    }

    #[test]
    fn collection_excludes_non_geolocated() {
        let located = Feature::new("aa").with_geometry(1.0, 2.0);
        let bare = Feature::new("bb");
        let doc = feature_collection(&[located, bare], None);
        assert_eq!(doc["features"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn missing_numeric_is_distinct_from_zero() {
        let mut props = Properties::new();
        assert_eq!(props.get_f64("voltage"), None);
        props.set("voltage", 0.0);
        assert_eq!(props.get_f64("voltage"), Some(0.0));
    }
}
