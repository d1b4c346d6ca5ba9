//! Per-source collection latency tracking for `/api/perf`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{json, Value};

/// Ring size per source. Old samples fall off; percentiles cover roughly the
/// last few hours at the default poll interval.
const WINDOW: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub last: f64,
}

#[derive(Default)]
pub struct PerfMonitor {
    latencies: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one collection duration in seconds. `source` is the collector
    /// name, or `"all"` for the whole aggregation cycle.
    pub fn record(&self, source: &str, seconds: f64) {
        let mut map = self.latencies.lock().unwrap();
        let ring = map.entry(source.to_string()).or_default();
        if ring.len() >= WINDOW {
            ring.pop_front();
        }
        ring.push_back(seconds);
    }

    pub fn stats(&self, source: &str) -> Option<LatencyStats> {
        let map = self.latencies.lock().unwrap();
        let ring = map.get(source)?;
        percentiles(ring)
    }

    pub fn report(&self, cache_hit_ratios: &HashMap<String, f64>) -> Value {
        let map = self.latencies.lock().unwrap();
        let mut sources = serde_json::Map::new();
        for (name, ring) in map.iter() {
            if let Some(stats) = percentiles(ring) {
                let mut entry = serde_json::to_value(&stats).unwrap_or(Value::Null);
                if let (Some(obj), Some(ratio)) = (entry.as_object_mut(), cache_hit_ratios.get(name)) {
                    obj.insert("cache_hit_ratio".into(), json!(ratio));
                }
                sources.insert(name.clone(), entry);
            }
        }
        json!({ "sources": sources })
    }
}

fn percentiles(ring: &VecDeque<f64>) -> Option<LatencyStats> {
    if ring.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = ring.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pick = |p: f64| {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx]
    };
    Some(LatencyStats {
        samples: sorted.len(),
        p50: pick(0.50),
        p90: pick(0.90),
        p99: pick(0.99),
        last: *ring.back().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_known_distribution() {
        let perf = PerfMonitor::new();
        for i in 1..=100 {
            perf.record("meshtastic", i as f64 / 100.0);
        }
        let stats = perf.stats("meshtastic").unwrap();
        assert_eq!(stats.samples, 100);
        assert!((stats.p50 - 0.50).abs() < 0.02);
        assert!((stats.p90 - 0.90).abs() < 0.02);
        assert!((stats.p99 - 0.99).abs() < 0.02);
        assert_eq!(stats.last, 1.0);
    }

    #[test]
    fn ring_is_bounded() {
        let perf = PerfMonitor::new();
        for _ in 0..(WINDOW + 50) {
            perf.record("aredn", 0.1);
        }
        assert_eq!(perf.stats("aredn").unwrap().samples, WINDOW);
    }

    #[test]
    fn unknown_source_is_none() {
        let perf = PerfMonitor::new();
        assert!(perf.stats("nope").is_none());
    }
}
