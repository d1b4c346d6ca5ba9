//! # mesh-model
//!
//! Shared data model for the MeshForge Maps observability server.
//!
//! These types are used by:
//! - `server`: collectors, the aggregator, and the HTTP/WebSocket delivery plane
//! - the browser map and terminal dashboard (as the JSON wire shape)
//!
//! ## Conventions
//!
//! - All coordinates are WGS84 decimal degrees. Meshtastic-style integer
//!   coordinates (scaled by 1e7) are accepted at ingest and converted.
//! - `(0, 0)`, Null Island, is treated as "no GPS fix" and rejected.
//! - Node IDs are 1–16 hex digits, case-insensitive, with an optional `!`
//!   prefix. The canonical form is lowercase with the prefix stripped
//!   (`!ABCD` and `abcd` are the same node).
//! - A missing numeric property is distinct from zero: `battery: 0` is a
//!   real reading, an absent key is "unknown".

pub mod feature;
pub mod topology;
pub mod validate;

pub use feature::{feature_collection, Feature, Network, Point, Properties};
pub use topology::{LinkQuality, TopologyLink};
pub use validate::{validate_coordinates, validate_node_id, ValidationError};

/// Deduplicate a feature sequence by node id, preserving first occurrence.
///
/// Every merge path in the aggregator funnels through this single helper so
/// "first collector in enable-order wins" holds everywhere.
pub fn deduplicate_features(features: Vec<Feature>) -> Vec<Feature> {
    let mut seen = std::collections::HashSet::with_capacity(features.len());
    features
        .into_iter()
        .filter(|f| seen.insert(f.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = Feature::new("deadbeef").with_property("name", "first");
        let b = Feature::new("deadbeef").with_property("name", "second");
        let c = Feature::new("cafe").with_property("name", "other");

        let out = deduplicate_features(vec![a, b, c]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].properties.get_str("name"), Some("first"));
        assert_eq!(out[1].id, "cafe");
    }
}
