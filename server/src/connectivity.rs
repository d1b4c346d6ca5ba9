//! # connectivity
//!
//! Per-node connectivity classifier: `new → stable → intermittent → offline`.
//!
//! Every position, info, and telemetry event counts as a heartbeat. Each
//! node keeps a bounded window of heartbeat timestamps; interval regularity
//! against an expected cadence drives the transitions, and a periodic
//! `check_offline` sweep catches silent nodes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::json;

pub type TransitionCallback = Box<dyn Fn(&str, NodeState, NodeState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    New,
    Stable,
    Intermittent,
    Offline,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::New => "new",
            NodeState::Stable => "stable",
            NodeState::Intermittent => "intermittent",
            NodeState::Offline => "offline",
        }
    }
}

struct NodeConn {
    heartbeats: VecDeque<i64>,
    state: NodeState,
    /// Consecutive on-cadence intervals, for the new→stable ramp.
    steady_run: u32,
}

pub struct ConnectivityConfig {
    /// Heartbeat window length.
    pub window: usize,
    /// Consecutive steady intervals required to leave `new`.
    pub stable_count: u32,
    /// Expected heartbeat cadence in seconds; an interval over twice this
    /// counts as a gap.
    pub expected_interval: i64,
    /// Windowed gap fraction beyond which a stable node degrades.
    pub gap_ratio_limit: f64,
    /// Silence threshold for the offline sweep.
    pub offline_threshold: i64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            window: 20,
            stable_count: 5,
            expected_interval: 60,
            gap_ratio_limit: 0.3,
            offline_threshold: 900,
        }
    }
}

pub struct ConnectivityTracker {
    config: ConnectivityConfig,
    nodes: Mutex<HashMap<String, NodeConn>>,
    on_transition: Mutex<Option<TransitionCallback>>,
}

impl ConnectivityTracker {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            nodes: Mutex::new(HashMap::new()),
            on_transition: Mutex::new(None),
        }
    }

    pub fn set_on_transition(&self, cb: TransitionCallback) {
        *self.on_transition.lock().unwrap() = Some(cb);
    }

    fn fire(&self, transitions: &[(String, NodeState, NodeState)]) {
        if transitions.is_empty() {
            return;
        }
        let cb = self.on_transition.lock().unwrap();
        if let Some(cb) = cb.as_ref() {
            for (id, old, new) in transitions {
                cb(id, *old, *new);
            }
        }
    }

    fn gap_ratio(&self, heartbeats: &VecDeque<i64>) -> f64 {
        if heartbeats.len() < 2 {
            return 0.0;
        }
        let threshold = self.config.expected_interval * 2;
        let mut gaps = 0usize;
        let mut intervals = 0usize;
        let mut prev = heartbeats[0];
        for &ts in heartbeats.iter().skip(1) {
            if ts - prev > threshold {
                gaps += 1;
            }
            intervals += 1;
            prev = ts;
        }
        gaps as f64 / intervals as f64
    }

    /// Record one heartbeat at `now`. Returns the transition, if any.
    pub fn record_heartbeat(&self, node_id: &str, now: i64) -> Option<(NodeState, NodeState)> {
        let transition = {
            let mut nodes = self.nodes.lock().unwrap();
            let conn = nodes.entry(node_id.to_string()).or_insert_with(|| NodeConn {
                heartbeats: VecDeque::with_capacity(self.config.window),
                state: NodeState::New,
                steady_run: 0,
            });

            let old = conn.state;
            let steady = conn
                .heartbeats
                .back()
                .map(|&last| now - last <= self.config.expected_interval * 2)
                .unwrap_or(false);
            conn.steady_run = if steady { conn.steady_run + 1 } else { 0 };

            if conn.heartbeats.len() >= self.config.window {
                conn.heartbeats.pop_front();
            }
            conn.heartbeats.push_back(now);

            let gap_ratio = self.gap_ratio(&conn.heartbeats);
            let new_state = match old {
                NodeState::Offline => NodeState::New,
                NodeState::New => {
                    if conn.steady_run >= self.config.stable_count {
                        NodeState::Stable
                    } else {
                        NodeState::New
                    }
                }
                NodeState::Stable => {
                    if gap_ratio > self.config.gap_ratio_limit {
                        NodeState::Intermittent
                    } else {
                        NodeState::Stable
                    }
                }
                NodeState::Intermittent => {
                    // Recovery path: a sustained steady run with few
                    // windowed gaps re-stabilizes the node
                    if conn.steady_run >= self.config.stable_count && gap_ratio <= 0.1 {
                        NodeState::Stable
                    } else {
                        NodeState::Intermittent
                    }
                }
            };

            if new_state != old {
                conn.state = new_state;
                if new_state == NodeState::New {
                    conn.steady_run = 0;
                }
                Some((old, new_state))
            } else {
                None
            }
        };

        if let Some((old, new)) = transition {
            self.fire(&[(node_id.to_string(), old, new)]);
        }
        transition
    }

    /// Sweep every node; nodes silent for `offline_threshold` or longer go
    /// offline. Returns the nodes that transitioned.
    pub fn check_offline(&self, now: i64) -> Vec<String> {
        let transitions: Vec<(String, NodeState, NodeState)> = {
            let mut nodes = self.nodes.lock().unwrap();
            let mut out = Vec::new();
            for (id, conn) in nodes.iter_mut() {
                if conn.state == NodeState::Offline {
                    continue;
                }
                let silent = conn
                    .heartbeats
                    .back()
                    .map(|&last| now - last >= self.config.offline_threshold)
                    .unwrap_or(true);
                if silent {
                    out.push((id.clone(), conn.state, NodeState::Offline));
                    conn.state = NodeState::Offline;
                    conn.steady_run = 0;
                }
            }
            out
        };
        self.fire(&transitions);
        transitions.into_iter().map(|(id, _, _)| id).collect()
    }

    pub fn state_of(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().unwrap().get(node_id).map(|c| c.state)
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.lock().unwrap().remove(node_id);
    }

    /// All nodes with state and last heartbeat, for `/api/node-states`.
    pub fn states(&self) -> Vec<serde_json::Value> {
        let nodes = self.nodes.lock().unwrap();
        let mut out: Vec<serde_json::Value> = nodes
            .iter()
            .map(|(id, c)| {
                json!({
                    "node_id": id,
                    "state": c.state.as_str(),
                    "last_heartbeat": c.heartbeats.back(),
                    "heartbeats": c.heartbeats.len(),
                })
            })
            .collect();
        out.sort_by(|a, b| a["node_id"].as_str().cmp(&b["node_id"].as_str()));
        out
    }

    pub fn summary(&self) -> HashMap<&'static str, usize> {
        let nodes = self.nodes.lock().unwrap();
        let mut counts: HashMap<&'static str, usize> =
            HashMap::from([("new", 0), ("stable", 0), ("intermittent", 0), ("offline", 0)]);
        for conn in nodes.values() {
            *counts.entry(conn.state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConnectivityTracker {
        ConnectivityTracker::new(ConnectivityConfig::default())
    }

    #[test]
    fn first_heartbeat_is_new() {
        let t = tracker();
        assert_eq!(t.record_heartbeat("aa", 1000), None);
        assert_eq!(t.state_of("aa"), Some(NodeState::New));
    }

    #[test]
    fn steady_cadence_reaches_stable() {
        let t = tracker();
        let mut now = 1000;
        for _ in 0..6 {
            t.record_heartbeat("aa", now);
            now += 60;
        }
        assert_eq!(t.state_of("aa"), Some(NodeState::Stable));
    }

    #[test]
    fn gaps_degrade_stable_to_intermittent() {
        let t = tracker();
        let mut now = 1000;
        for _ in 0..6 {
            t.record_heartbeat("aa", now);
            now += 60;
        }
        assert_eq!(t.state_of("aa"), Some(NodeState::Stable));
        // Alternate long gaps to push the windowed gap ratio over 0.3
        for _ in 0..6 {
            now += 500;
            t.record_heartbeat("aa", now);
        }
        assert_eq!(t.state_of("aa"), Some(NodeState::Intermittent));
    }

    #[test]
    fn intermittent_recovers_after_sustained_steady_run() {
        let t = tracker();
        let mut now = 1000;
        for _ in 0..6 {
            t.record_heartbeat("aa", now);
            now += 60;
        }
        for _ in 0..6 {
            now += 500;
            t.record_heartbeat("aa", now);
        }
        assert_eq!(t.state_of("aa"), Some(NodeState::Intermittent));
        // Long steady run pushes the gaps out of the window
        for _ in 0..20 {
            now += 60;
            t.record_heartbeat("aa", now);
        }
        assert_eq!(t.state_of("aa"), Some(NodeState::Stable));
    }

    #[test]
    fn offline_sweep_at_exact_threshold() {
        let t = tracker();
        t.record_heartbeat("aa", 1000);
        // Exactly at the deadline transitions on the sweep
        let offline = t.check_offline(1000 + 900);
        assert_eq!(offline, vec!["aa".to_string()]);
        assert_eq!(t.state_of("aa"), Some(NodeState::Offline));
    }

    #[test]
    fn offline_node_restarts_as_new() {
        let t = tracker();
        t.record_heartbeat("aa", 1000);
        t.check_offline(10_000);
        let transition = t.record_heartbeat("aa", 10_100);
        assert_eq!(transition, Some((NodeState::Offline, NodeState::New)));
    }

    #[test]
    fn transition_callback_fires() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let t = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        t.set_on_transition(Box::new(move |_, _, new| {
            if new == NodeState::Stable {
                f.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let mut now = 1000;
        for _ in 0..8 {
            t.record_heartbeat("aa", now);
            now += 60;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn summary_counts_states() {
        let t = tracker();
        t.record_heartbeat("aa", 1000);
        t.record_heartbeat("bb", 1000);
        t.check_offline(100_000);
        let summary = t.summary();
        assert_eq!(summary["offline"], 2);
        assert_eq!(summary["new"], 0);
    }
}
