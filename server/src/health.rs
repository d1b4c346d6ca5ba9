//! # health
//!
//! Composite 0–100 node health score.
//!
//! Five weighted components (battery 25, signal 25, freshness 20,
//! reliability 15, congestion 15). A component with no input is excluded
//! from both the numerator and the denominator, so a node reporting only
//! battery and freshness can still score 100. No input at all means no
//! score: the API omits the node rather than inventing a number.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{json, Map, Value};

use mesh_model::Properties;

use crate::connectivity::NodeState;
use crate::util::round1;

const CACHE_CAP: usize = 10_000;

/// Linear ramp from `worst` → 0 to `best` → `max`, clamped. Works in either
/// direction (`worst > best` inverts).
fn ramp(value: f64, worst: f64, best: f64, max: f64) -> f64 {
    let span = best - worst;
    if span.abs() < f64::EPSILON {
        return max;
    }
    ((value - worst) / span).clamp(0.0, 1.0) * max
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub score: f64,
    pub status: &'static str,
    pub components: Map<String, Value>,
}

pub fn status_label(score: f64) -> &'static str {
    if score >= 80.0 {
        "excellent"
    } else if score >= 60.0 {
        "good"
    } else if score >= 40.0 {
        "fair"
    } else if score >= 20.0 {
        "poor"
    } else {
        "critical"
    }
}

/// Score one node from its current properties and connectivity state.
/// Returns None when no component has any input.
pub fn score_node(props: &Properties, state: Option<NodeState>, now: i64) -> Option<HealthReport> {
    let mut components = Map::new();
    let mut total = 0.0;
    let mut max_total = 0.0;

    let mut push = |name: &str, score: f64, max: f64| {
        components.insert(name.to_string(), json!({ "score": round1(score), "max": max }));
        total += score;
        max_total += max;
    };

    // battery: percent and/or voltage, equal weights when both present
    let pct = props.get_f64("battery").map(|p| ramp(p, 20.0, 80.0, 25.0));
    let volts = props.get_f64("voltage").map(|v| ramp(v, 3.0, 3.7, 25.0));
    match (pct, volts) {
        (Some(p), Some(v)) => push("battery", 0.5 * p + 0.5 * v, 25.0),
        (Some(p), None) => push("battery", p, 25.0),
        (None, Some(v)) => push("battery", v, 25.0),
        (None, None) => {}
    }

    // signal: snr dominates, hop distance contributes
    let snr = props.get_f64("snr").map(|s| ramp(s, -10.0, 8.0, 25.0));
    let hops = props
        .get_f64("hops_away")
        .map(|h| ramp(h, 7.0, 0.0, 25.0));
    match (snr, hops) {
        (Some(s), Some(h)) => push("signal", 0.7 * s + 0.3 * h, 25.0),
        (Some(s), None) => push("signal", s, 25.0),
        (None, Some(h)) => push("signal", h, 25.0),
        (None, None) => {}
    }

    // freshness: observation age
    if let Some(last_seen) = props.last_seen() {
        let age = (now - last_seen).max(0) as f64;
        push("freshness", ramp(age, 3600.0, 300.0, 20.0), 20.0);
    }

    // reliability: connectivity classifier verdict
    if let Some(state) = state {
        let score = match state {
            NodeState::Stable => 15.0,
            NodeState::New => 10.5,
            NodeState::Intermittent => 4.5,
            NodeState::Offline => 0.0,
        };
        push("reliability", score, 15.0);
    }

    // congestion: channel utilization, inverted
    let chan = props
        .get_f64("channel_util")
        .map(|u| ramp(u, 75.0, 25.0, 15.0));
    let air = props
        .get_f64("air_util_tx")
        .map(|u| ramp(u, 75.0, 25.0, 15.0));
    match (chan, air) {
        (Some(c), Some(a)) => push("congestion", 0.5 * (c + a), 15.0),
        (Some(c), None) => push("congestion", c, 15.0),
        (None, Some(a)) => push("congestion", a, 15.0),
        (None, None) => {}
    }

    if max_total == 0.0 {
        return None;
    }

    let score = 100.0 * total / max_total;
    Some(HealthReport {
        score,
        status: status_label(score),
        components,
    })
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct CachedHealth {
    report: HealthReport,
    computed_at: i64,
}

/// Bounded cache of the most recent score per node. Mirrors the node
/// store's LRU discipline; `remove` is wired into the eviction hooks.
#[derive(Default)]
pub struct HealthScorer {
    cache: Mutex<HashMap<String, CachedHealth>>,
}

impl HealthScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        node_id: &str,
        props: &Properties,
        state: Option<NodeState>,
        now: i64,
    ) -> Option<HealthReport> {
        let report = score_node(props, state, now)?;
        let mut cache = self.cache.lock().unwrap();
        if !cache.contains_key(node_id) && cache.len() >= CACHE_CAP {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, c)| c.computed_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            node_id.to_string(),
            CachedHealth {
                report: report.clone(),
                computed_at: now,
            },
        );
        Some(report)
    }

    pub fn get(&self, node_id: &str) -> Option<HealthReport> {
        self.cache
            .lock()
            .unwrap()
            .get(node_id)
            .map(|c| c.report.clone())
    }

    pub fn remove(&self, node_id: &str) {
        self.cache.lock().unwrap().remove(node_id);
    }

    /// `{nodes: [{node_id, score, status}, …]}` for `/api/node-health`.
    pub fn all(&self) -> Vec<Value> {
        let cache = self.cache.lock().unwrap();
        let mut out: Vec<Value> = cache
            .iter()
            .map(|(id, c)| {
                json!({
                    "node_id": id,
                    "score": round1(c.report.score),
                    "status": c.report.status,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b["score"]
                .as_f64()
                .partial_cmp(&a["score"].as_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    /// Status distribution for `/api/node-health/summary`.
    pub fn summary(&self) -> Value {
        let cache = self.cache.lock().unwrap();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut sum = 0.0;
        for c in cache.values() {
            *counts.entry(c.report.status).or_insert(0) += 1;
            sum += c.report.score;
        }
        let n = cache.len();
        json!({
            "scored_nodes": n,
            "average_score": if n > 0 { Some(round1(sum / n as f64)) } else { None },
            "distribution": {
                "excellent": counts.get("excellent").copied().unwrap_or(0),
                "good": counts.get("good").copied().unwrap_or(0),
                "fair": counts.get("fair").copied().unwrap_or(0),
                "poor": counts.get("poor").copied().unwrap_or(0),
                "critical": counts.get("critical").copied().unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        let mut p = Properties::new();
        for (k, v) in pairs {
            p.set(k, v.clone());
        }
        p
    }

    #[test]
    fn sparse_inputs_normalize_to_full_scale() {
        // battery 100% (25/25) + fresh observation (20/20) = 45/45 → 100
        let now = 1_700_000_000;
        let p = props(&[("battery", json!(100)), ("last_seen", json!(now))]);
        let report = score_node(&p, None, now).unwrap();
        assert_eq!(report.score, 100.0);
        assert_eq!(report.status, "excellent");
        assert_eq!(report.components.len(), 2);
    }

    #[test]
    fn no_inputs_means_no_score() {
        assert!(score_node(&Properties::new(), None, 0).is_none());
    }

    #[test]
    fn battery_ramp_endpoints() {
        let now = 0;
        let low = props(&[("battery", json!(20))]);
        assert_eq!(score_node(&low, None, now).unwrap().score, 0.0);
        let high = props(&[("battery", json!(80))]);
        assert_eq!(score_node(&high, None, now).unwrap().score, 100.0);
        let mid = props(&[("battery", json!(50))]);
        assert_eq!(score_node(&mid, None, now).unwrap().score, 50.0);
    }

    #[test]
    fn battery_zero_is_a_real_input() {
        let p = props(&[("battery", json!(0))]);
        let report = score_node(&p, None, 0).unwrap();
        assert_eq!(report.score, 0.0);
        assert_eq!(report.status, "critical");
    }

    #[test]
    fn signal_blends_snr_and_hops() {
        // snr 8 → 25, hops 0 → 25, blend 0.7/0.3 → full marks
        let p = props(&[("snr", json!(8.0)), ("hops_away", json!(0))]);
        assert_eq!(score_node(&p, None, 0).unwrap().score, 100.0);
        // snr -10 → 0 with 7 hops → 0
        let p = props(&[("snr", json!(-10.0)), ("hops_away", json!(7))]);
        assert_eq!(score_node(&p, None, 0).unwrap().score, 0.0);
    }

    #[test]
    fn reliability_tracks_connectivity_state() {
        let p = props(&[("battery", json!(80))]);
        let stable = score_node(&p, Some(NodeState::Stable), 0).unwrap();
        let offline = score_node(&p, Some(NodeState::Offline), 0).unwrap();
        // 25 + 15 of 40 vs 25 + 0 of 40
        assert_eq!(stable.score, 100.0);
        assert_eq!(offline.score, 62.5);
    }

    #[test]
    fn score_bounded_0_100() {
        let p = props(&[
            ("battery", json!(200)),
            ("voltage", json!(9.9)),
            ("snr", json!(40.0)),
            ("channel_util", json!(-5.0)),
        ]);
        let report = score_node(&p, Some(NodeState::Stable), 0).unwrap();
        assert!(report.score <= 100.0);
        let p = props(&[("battery", json!(-50))]);
        assert!(score_node(&p, None, 0).unwrap().score >= 0.0);
    }

    #[test]
    fn cache_eviction_hook() {
        let scorer = HealthScorer::new();
        let p = props(&[("battery", json!(50))]);
        scorer.update("aa", &p, None, 100);
        assert!(scorer.get("aa").is_some());
        scorer.remove("aa");
        assert!(scorer.get("aa").is_none());
    }
}
