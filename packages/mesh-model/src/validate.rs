//! Coordinate and node-ID validation.
//!
//! Both validators are pure: no I/O, no clock. They sit at every ingest
//! boundary (broker envelopes, collector responses, API path parameters) so
//! nothing downstream ever sees an unchecked coordinate or id.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Meshtastic-convention integer coordinates are degrees scaled by 1e7.
const INT_COORD_SCALE: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum ValidationError {
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),
}

fn node_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^!?[0-9a-fA-F]{1,16}$").unwrap())
}

/// Validate a latitude/longitude pair and return the canonical float pair.
///
/// Rejects NaN and ±∞, out-of-WGS84-range values, and exactly `(0, 0)`
/// (Null Island, the upstream "no fix" sentinel). With `convert_int` the
/// inputs are treated as 1e7-scaled integers and descaled before the same
/// checks run.
pub fn validate_coordinates(
    lat: f64,
    lon: f64,
    convert_int: bool,
) -> Result<(f64, f64), ValidationError> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err(ValidationError::InvalidCoordinates(format!(
            "non-finite lat/lon ({lat}, {lon})"
        )));
    }

    let (lat, lon) = if convert_int {
        (lat * INT_COORD_SCALE, lon * INT_COORD_SCALE)
    } else {
        (lat, lon)
    };

    if lat.abs() > 90.0 {
        return Err(ValidationError::InvalidCoordinates(format!(
            "latitude {lat} outside [-90, 90]"
        )));
    }
    if lon.abs() > 180.0 {
        return Err(ValidationError::InvalidCoordinates(format!(
            "longitude {lon} outside [-180, 180]"
        )));
    }
    if lat == 0.0 && lon == 0.0 {
        return Err(ValidationError::InvalidCoordinates(
            "Null Island (0, 0), no GPS fix".into(),
        ));
    }

    Ok((lat, lon))
}

/// Validate a node id and return its canonical form: lowercased, leading
/// `!` stripped. Equality on canonical ids is therefore case-insensitive
/// and prefix-insensitive.
pub fn validate_node_id(id: &str) -> Result<String, ValidationError> {
    if !node_id_re().is_match(id) {
        return Err(ValidationError::InvalidNodeId(id.to_string()));
    }
    Ok(id.trim_start_matches('!').to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_island() {
        assert!(validate_coordinates(0.0, 0.0, false).is_err());
        // Integer zero pair descales to (0, 0) and is still rejected
        assert!(validate_coordinates(0.0, 0.0, true).is_err());
    }

    #[test]
    fn accepts_single_zero_axis() {
        assert_eq!(validate_coordinates(0.0, 1e-9, false), Ok((0.0, 1e-9)));
        assert_eq!(validate_coordinates(1e-9, 0.0, false), Ok((1e-9, 0.0)));
    }

    #[test]
    fn rejects_non_finite() {
        assert!(validate_coordinates(f64::NAN, 10.0, false).is_err());
        assert!(validate_coordinates(10.0, f64::INFINITY, false).is_err());
        assert!(validate_coordinates(f64::NEG_INFINITY, 10.0, false).is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(validate_coordinates(90.001, 0.0, false).is_err());
        assert!(validate_coordinates(-91.0, 0.0, false).is_err());
        assert!(validate_coordinates(45.0, 180.5, false).is_err());
        // Range edges are valid
        assert!(validate_coordinates(90.0, -180.0, false).is_ok());
    }

    #[test]
    fn converts_scaled_integers() {
        // 47.6062° N, 122.3321° W as Meshtastic i32 coordinates
        let (lat, lon) = validate_coordinates(476062000.0, -1223321000.0, true).unwrap();
        assert!((lat - 47.6062).abs() < 1e-6);
        assert!((lon + 122.3321).abs() < 1e-6);
        // Scaled input out of range after descale
        assert!(validate_coordinates(950000000.0, 0.0, true).is_err());
    }

    #[test]
    fn node_id_canonical_form() {
        assert_eq!(validate_node_id("!DEADbeef").unwrap(), "deadbeef");
        assert_eq!(validate_node_id("deadbeef").unwrap(), "deadbeef");
        // Prefix-insensitivity: x and !x canonicalize identically
        for id in ["a", "0123456789abcdef", "FFFF"] {
            let bare = validate_node_id(id).unwrap();
            let prefixed = validate_node_id(&format!("!{id}")).unwrap();
            assert_eq!(bare, prefixed);
        }
    }

    #[test]
    fn node_id_rejects_malformed() {
        for bad in ["", "!", "xyz!", "g000", "0123456789abcdef0", "!!ab", "ab cd"] {
            assert!(validate_node_id(bad).is_err(), "{bad:?} should fail");
        }
    }
}
