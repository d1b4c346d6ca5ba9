//! # drift
//!
//! Configuration drift detection.
//!
//! Keeps the last observed descriptor per node and diffs each new one
//! against it. A changed radio parameter (`region`, `modem_preset`) is a
//! critical drift (those usually mean the node left the mesh's shared
//! channel); identity churn (`name`, `short_name`) is informational.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

pub type DriftCallback = Box<dyn Fn(&Drift) + Send + Sync>;

/// Fields diffed per node, in emit order.
pub const TRACKED_FIELDS: &[&str] = &[
    "region",
    "modem_preset",
    "channel_name",
    "hop_limit",
    "tx_power",
    "role",
    "hardware",
    "firmware",
    "name",
    "short_name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Info,
    Warning,
    Critical,
}

impl DriftSeverity {
    pub fn for_field(field: &str) -> Self {
        match field {
            "region" | "modem_preset" => DriftSeverity::Critical,
            "role" | "hardware" => DriftSeverity::Warning,
            _ => DriftSeverity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Info => "info",
            DriftSeverity::Warning => "warning",
            DriftSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(DriftSeverity::Info),
            "warning" => Some(DriftSeverity::Warning),
            "critical" => Some(DriftSeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Drift {
    pub node_id: String,
    pub field: String,
    pub old: Value,
    pub new: Value,
    pub severity: DriftSeverity,
    pub timestamp: i64,
}

struct NodeDriftState {
    snapshot: BTreeMap<String, Value>,
    history: VecDeque<Drift>,
    updated_at: i64,
}

pub struct DriftDetector {
    max_history: usize,
    max_nodes: usize,
    nodes: Mutex<HashMap<String, NodeDriftState>>,
    on_drift: Mutex<Option<DriftCallback>>,
}

/// Value comparison with numeric widening (`1 == 1.0`) and trimmed strings.
fn normalized_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => return x == y,
        _ => {}
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => return x.trim() == y.trim(),
        _ => {}
    }
    a == b
}

impl DriftDetector {
    pub fn new(max_history: usize, max_nodes: usize) -> Self {
        Self {
            max_history,
            max_nodes,
            nodes: Mutex::new(HashMap::new()),
            on_drift: Mutex::new(None),
        }
    }

    pub fn set_on_drift(&self, cb: DriftCallback) {
        *self.on_drift.lock().unwrap() = Some(cb);
    }

    /// Diff `fields` against the node's last snapshot. Emits one `Drift`
    /// per changed tracked field and atomically replaces the snapshot.
    pub fn check_node(
        &self,
        node_id: &str,
        fields: &BTreeMap<String, Value>,
        now: i64,
    ) -> Vec<Drift> {
        let drifts = {
            let mut nodes = self.nodes.lock().unwrap();

            if !nodes.contains_key(node_id) && nodes.len() >= self.max_nodes {
                if let Some(oldest) = nodes
                    .iter()
                    .min_by_key(|(_, s)| s.updated_at)
                    .map(|(k, _)| k.clone())
                {
                    nodes.remove(&oldest);
                }
            }

            let state = nodes.entry(node_id.to_string()).or_insert_with(|| NodeDriftState {
                snapshot: BTreeMap::new(),
                history: VecDeque::new(),
                updated_at: now,
            });
            state.updated_at = now;

            let mut drifts = Vec::new();
            for &field in TRACKED_FIELDS {
                let Some(new) = fields.get(field) else { continue };
                if new.is_null() {
                    continue;
                }
                match state.snapshot.get(field) {
                    Some(old) if !normalized_eq(old, new) => {
                        drifts.push(Drift {
                            node_id: node_id.to_string(),
                            field: field.to_string(),
                            old: old.clone(),
                            new: new.clone(),
                            severity: DriftSeverity::for_field(field),
                            timestamp: now,
                        });
                    }
                    _ => {}
                }
                state.snapshot.insert(field.to_string(), new.clone());
            }

            for drift in &drifts {
                if state.history.len() >= self.max_history {
                    state.history.pop_front();
                }
                state.history.push_back(drift.clone());
            }
            drifts
        };

        if !drifts.is_empty() {
            let cb = self.on_drift.lock().unwrap();
            if let Some(cb) = cb.as_ref() {
                for drift in &drifts {
                    cb(drift);
                }
            }
        }
        drifts
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.lock().unwrap().remove(node_id);
    }

    /// Drift history across all nodes, newest first, optionally filtered.
    pub fn drifts(&self, since: Option<i64>, severity: Option<DriftSeverity>) -> Vec<Drift> {
        let nodes = self.nodes.lock().unwrap();
        let mut out: Vec<Drift> = nodes
            .values()
            .flat_map(|s| s.history.iter().cloned())
            .filter(|d| since.map(|t| d.timestamp >= t).unwrap_or(true))
            .filter(|d| severity.map(|s| d.severity == s).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn first_observation_is_not_drift() {
        let d = DriftDetector::new(50, 1000);
        let out = d.check_node("aa", &fields(&[("region", json!("US"))]), 100);
        assert!(out.is_empty());
    }

    #[test]
    fn changed_field_emits_with_severity() {
        let d = DriftDetector::new(50, 1000);
        d.check_node("aa", &fields(&[("region", json!("US")), ("name", json!("Alpha"))]), 100);
        let out = d.check_node(
            "aa",
            &fields(&[("region", json!("EU_868")), ("name", json!("Alpha"))]),
            200,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field, "region");
        assert_eq!(out[0].severity, DriftSeverity::Critical);
        assert_eq!(out[0].old, json!("US"));
    }

    #[test]
    fn numeric_widening_is_not_drift() {
        let d = DriftDetector::new(50, 1000);
        d.check_node("aa", &fields(&[("hop_limit", json!(3))]), 100);
        let out = d.check_node("aa", &fields(&[("hop_limit", json!(3.0))]), 200);
        assert!(out.is_empty());
    }

    #[test]
    fn whitespace_is_not_drift() {
        let d = DriftDetector::new(50, 1000);
        d.check_node("aa", &fields(&[("name", json!("Base"))]), 100);
        let out = d.check_node("aa", &fields(&[("name", json!(" Base "))]), 200);
        assert!(out.is_empty());
    }

    #[test]
    fn severity_table() {
        assert_eq!(DriftSeverity::for_field("modem_preset"), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::for_field("hardware"), DriftSeverity::Warning);
        assert_eq!(DriftSeverity::for_field("short_name"), DriftSeverity::Info);
        assert_eq!(DriftSeverity::for_field("tx_power"), DriftSeverity::Info);
    }

    #[test]
    fn history_is_bounded_and_filterable() {
        let d = DriftDetector::new(3, 1000);
        d.check_node("aa", &fields(&[("tx_power", json!(0))]), 0);
        for i in 1..=5i64 {
            d.check_node("aa", &fields(&[("tx_power", json!(i))]), i * 10);
        }
        let all = d.drifts(None, None);
        assert_eq!(all.len(), 3);
        // Newest first
        assert_eq!(all[0].timestamp, 50);
        assert!(d.drifts(Some(45), None).len() == 1);
        assert!(d.drifts(None, Some(DriftSeverity::Critical)).is_empty());
    }

    #[test]
    fn callback_fires_outside_lock() {
        let d = DriftDetector::new(50, 1000);
        d.check_node("aa", &fields(&[("role", json!("CLIENT"))]), 100);
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f = fired.clone();
        d.set_on_drift(Box::new(move |drift| {
            assert_eq!(drift.severity, DriftSeverity::Warning);
            f.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        d.check_node("aa", &fields(&[("role", json!("ROUTER"))]), 200);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
