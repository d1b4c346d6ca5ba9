//! # hamclock_compat
//!
//! Pure compatibility layer over the two ham-clock service lineages.
//!
//! OpenHamClock and legacy HamClock expose the same logical data under
//! different endpoint paths, key spellings, and case conventions. The
//! propagation collector probes both and runs every response through these
//! normalizers so the rest of the server only ever sees canonical keys.
//! No I/O happens here.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    OpenHamClock,
    HamClock,
    Unknown,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::OpenHamClock => "openhamclock",
            Variant::HamClock => "hamclock",
            Variant::Unknown => "unknown",
        }
    }
}

/// Classify a `sys` document by its marker strings.
pub fn detect_variant(sys_doc: &str) -> Variant {
    let lower = sys_doc.to_ascii_lowercase();
    if lower.contains("openhamclock") {
        Variant::OpenHamClock
    } else if lower.contains("hamclock") {
        Variant::HamClock
    } else {
        Variant::Unknown
    }
}

/// Logical endpoint name → URL path for a given variant. The unknown
/// variant gets the legacy table (the safer probe target).
pub fn get_endpoint_map(variant: Variant) -> HashMap<&'static str, &'static str> {
    match variant {
        Variant::OpenHamClock => HashMap::from([
            ("space_weather", "/api/spacewx"),
            ("band_conditions", "/api/bandconditions"),
            ("voacap", "/api/voacap"),
            ("de", "/api/de"),
            ("dx", "/api/dx"),
            ("dxspots", "/api/dxspots"),
            ("sys", "/api/sys"),
        ]),
        Variant::HamClock | Variant::Unknown => HashMap::from([
            ("space_weather", "/get_spacewx.txt"),
            ("band_conditions", "/get_bc.txt"),
            ("voacap", "/get_voacap.txt"),
            ("de", "/get_de.txt"),
            ("dx", "/get_dx.txt"),
            ("dxspots", "/get_dxspots.txt"),
            ("sys", "/get_sys.txt"),
        ]),
    }
}

fn fold_keys(doc: &Value, aliases: &[(&str, &[&str])]) -> Map<String, Value> {
    let mut out = Map::new();
    let Some(obj) = doc.as_object() else {
        return out;
    };
    // Case-insensitive view of the source document
    let lowered: HashMap<String, &Value> =
        obj.iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
    for (canonical, names) in aliases {
        for name in *names {
            if let Some(v) = lowered.get(*name) {
                out.insert(canonical.to_string(), (*v).clone());
                break;
            }
        }
    }
    out
}

/// Canonical space-weather shape: `sfi`, `ssn`, `kp`, `xray`, `aurora`,
/// `solar_wind`.
pub fn normalize_spacewx(doc: &Value) -> Value {
    Value::Object(fold_keys(
        doc,
        &[
            ("sfi", &["sfi", "solar_flux", "flux"]),
            ("ssn", &["ssn", "sunspots", "sunspot_number"]),
            ("kp", &["kp", "kp_index", "kpindex"]),
            ("xray", &["xray", "x_ray", "xrays"]),
            ("aurora", &["aurora", "aurora_pct"]),
            ("solar_wind", &["solar_wind", "swind", "wind_speed"]),
        ],
    ))
}

/// Canonical DE/DX station shape: `call`, `grid`, `lat`, `lon`.
pub fn normalize_de_dx(doc: &Value) -> Value {
    Value::Object(fold_keys(
        doc,
        &[
            ("call", &["call", "callsign", "de_call", "dx_call"]),
            ("grid", &["grid", "maidenhead", "grid_square"]),
            ("lat", &["lat", "latitude"]),
            ("lon", &["lon", "lng", "long", "longitude"]),
        ],
    ))
}

fn band_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // The surrounding groups keep a band number from continuing a longer
    // number in either direction ("180m" and "x158" are not bands)
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9])(80|40|30|20|17|15|12|10)m?(?:[^0-9]|$)").unwrap()
    })
}

/// Extract the metre-band number from a key like `"80m"`, `"bc_40"`, or
/// `"path_20m_rel"`.
pub fn parse_band_key(key: &str) -> Option<u8> {
    band_key_re()
        .captures(key)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Canonical band-condition shape: `{"80": .., "40": .., ...}` keyed by
/// metre band, values passed through.
pub fn normalize_band_conditions(doc: &Value) -> Value {
    let mut out = Map::new();
    if let Some(obj) = doc.as_object() {
        for (key, value) in obj {
            if let Some(band) = parse_band_key(key) {
                out.insert(band.to_string(), value.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variant_markers() {
        assert_eq!(detect_variant("OpenHamClock v1.2"), Variant::OpenHamClock);
        assert_eq!(detect_variant("HamClock 4.08 uptime=33"), Variant::HamClock);
        assert_eq!(detect_variant("nginx/1.24"), Variant::Unknown);
    }

    #[test]
    fn endpoint_maps_cover_all_logical_names() {
        for variant in [Variant::OpenHamClock, Variant::HamClock, Variant::Unknown] {
            let map = get_endpoint_map(variant);
            for name in ["space_weather", "band_conditions", "voacap", "de", "dx", "dxspots", "sys"] {
                assert!(map.contains_key(name), "{name} missing for {variant:?}");
            }
        }
    }

    #[test]
    fn spacewx_key_folding() {
        let legacy = json!({"SFI": 142, "Kp_Index": 3, "sunspots": 88});
        let out = normalize_spacewx(&legacy);
        assert_eq!(out["sfi"], 142);
        assert_eq!(out["kp"], 3);
        assert_eq!(out["ssn"], 88);
        assert!(out.get("xray").is_none());
    }

    #[test]
    fn de_dx_key_folding() {
        let doc = json!({"Callsign": "W1AW", "Lng": -72.7, "latitude": 41.7});
        let out = normalize_de_dx(&doc);
        assert_eq!(out["call"], "W1AW");
        assert_eq!(out["lon"], -72.7);
        assert_eq!(out["lat"], 41.7);
    }

    #[test]
    fn band_key_parsing() {
        assert_eq!(parse_band_key("80m"), Some(80));
        assert_eq!(parse_band_key("bc_40"), Some(40));
        assert_eq!(parse_band_key("path_20m_rel"), Some(20));
        assert_eq!(parse_band_key("10"), Some(10));
        // Not a band: 80 continuing a longer number, or absent entirely
        assert_eq!(parse_band_key("180m"), None);
        assert_eq!(parse_band_key("mhz"), None);
        assert_eq!(parse_band_key("60m"), None);
    }

    #[test]
    fn band_conditions_keyed_by_metre_band() {
        let doc = json!({"80m": "Poor", "bc_20": "Good", "noise": -120});
        let out = normalize_band_conditions(&doc);
        assert_eq!(out["80"], "Poor");
        assert_eq!(out["20"], "Good");
        assert!(out.get("noise").is_none());
    }
}
