//! # alerts
//!
//! Threshold alerting over node metrics.
//!
//! Rules are evaluated in definition order against each node's property
//! bag (plus the composite health score); a `(node, rule)` pair fires at
//! most once per cooldown window. Fired alerts land in a bounded in-memory
//! history and fan out through four best-effort channels: a local callback,
//! the MQTT alert topics (QoS 1, base + per-severity), a webhook POST, and
//! an `alert.fired` bus event. A failing channel never blocks the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use mesh_model::{Network, Properties};

use crate::events::{Event, EventBus, EventType};

// ── Rules ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl Operator {
    pub fn eval(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Lt => value < threshold,
            Operator::Lte => value <= threshold,
            Operator::Gt => value > threshold,
            Operator::Gte => value >= threshold,
            Operator::Eq => value == threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub alert_type: String,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub severity: Severity,
    pub cooldown_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    pub enabled: bool,
}

impl AlertRule {
    fn new(
        rule_id: &str,
        metric: &str,
        operator: Operator,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            alert_type: "threshold".to_string(),
            metric: metric.to_string(),
            operator,
            threshold,
            severity,
            cooldown_secs: 600,
            network: None,
            enabled: true,
        }
    }
}

pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("battery_low", "battery", Operator::Lte, 20.0, Severity::Warning),
        AlertRule::new("battery_critical", "battery", Operator::Lte, 5.0, Severity::Critical),
        AlertRule::new("signal_poor", "snr", Operator::Lte, -10.0, Severity::Warning),
        AlertRule::new("congestion_high", "channel_util", Operator::Gte, 75.0, Severity::Warning),
        AlertRule::new("health_degraded", "health_score", Operator::Lte, 20.0, Severity::Warning),
    ]
}

// ── Alerts ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: u64,
    pub rule_id: String,
    pub node_id: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: i64,
    pub acknowledged: bool,
}

struct EngineInner {
    rules: Vec<AlertRule>,
    history: VecDeque<Alert>,
    /// `(node_id, rule_id)` → last fired timestamp.
    cooldowns: HashMap<(String, String), i64>,
    next_id: u64,
}

pub struct AlertEngine {
    max_history: usize,
    inner: Mutex<EngineInner>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, max_history: usize) -> Self {
        Self {
            max_history,
            inner: Mutex::new(EngineInner {
                rules,
                history: VecDeque::new(),
                cooldowns: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn fire_locked(
        inner: &mut EngineInner,
        max_history: usize,
        rule_id: &str,
        node_id: &str,
        metric: &str,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: String,
        now: i64,
    ) -> Alert {
        inner.next_id += 1;
        let alert = Alert {
            alert_id: inner.next_id,
            rule_id: rule_id.to_string(),
            node_id: node_id.to_string(),
            metric: metric.to_string(),
            value,
            threshold,
            severity,
            message,
            timestamp: now,
            acknowledged: false,
        };
        if inner.history.len() >= max_history {
            inner.history.pop_front();
        }
        inner.history.push_back(alert.clone());
        inner
            .cooldowns
            .insert((node_id.to_string(), rule_id.to_string()), now);
        alert
    }

    /// Evaluate every enabled rule against one node. Returns the alerts
    /// that fired (already recorded in history); the caller delivers them.
    pub fn evaluate_node(
        &self,
        node_id: &str,
        props: &Properties,
        health_score: Option<f64>,
        now: i64,
    ) -> Vec<Alert> {
        let network = props.network();
        let mut inner = self.inner.lock().unwrap();
        let rules = inner.rules.clone();
        let mut fired = Vec::new();

        for rule in &rules {
            if !rule.enabled {
                continue;
            }
            if let Some(wanted) = rule.network {
                if network != Some(wanted) {
                    continue;
                }
            }
            let value = if rule.metric == "health_score" {
                health_score
            } else {
                props.get_f64(&rule.metric)
            };
            let Some(value) = value else { continue };
            if !rule.operator.eval(value, rule.threshold) {
                continue;
            }
            let key = (node_id.to_string(), rule.rule_id.clone());
            if let Some(&last) = inner.cooldowns.get(&key) {
                if now - last < rule.cooldown_secs {
                    continue;
                }
            }
            let message = format!(
                "{} on !{node_id}: {} {} {} {}",
                rule.rule_id,
                rule.metric,
                value,
                rule.operator.as_str(),
                rule.threshold
            );
            fired.push(Self::fire_locked(
                &mut inner,
                self.max_history,
                &rule.rule_id,
                node_id,
                &rule.metric,
                value,
                rule.threshold,
                rule.severity,
                message,
                now,
            ));
        }
        fired
    }

    /// Absence-based offline alert: fires when the node has been silent
    /// past `threshold` and no offline alert is inside its cooldown.
    pub fn evaluate_offline(
        &self,
        node_id: &str,
        last_seen: i64,
        threshold: i64,
        now: i64,
    ) -> Option<Alert> {
        let age = now - last_seen;
        if age <= threshold {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = (node_id.to_string(), "offline".to_string());
        if let Some(&last) = inner.cooldowns.get(&key) {
            if now - last < 600 {
                return None;
            }
        }
        let message = format!("offline: !{node_id} silent for {age}s");
        Some(Self::fire_locked(
            &mut inner,
            self.max_history,
            "offline",
            node_id,
            "last_seen",
            age as f64,
            threshold as f64,
            Severity::Warning,
            message,
            now,
        ))
    }

    /// Idempotent: acknowledging twice leaves the flag set.
    pub fn acknowledge(&self, alert_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.history.iter_mut().find(|a| a.alert_id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn alerts(
        &self,
        severity: Option<Severity>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Vec<Alert> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .rev()
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .filter(|a| node_id.map(|n| a.node_id == n).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn active(&self) -> Vec<Alert> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .rev()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.inner.lock().unwrap().rules.clone()
    }

    pub fn summary(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let mut by_severity: HashMap<&'static str, usize> = HashMap::new();
        for a in &inner.history {
            *by_severity.entry(a.severity.as_str()).or_insert(0) += 1;
        }
        json!({
            "total": inner.history.len(),
            "unacknowledged": inner.history.iter().filter(|a| !a.acknowledged).count(),
            "by_severity": {
                "info": by_severity.get("info").copied().unwrap_or(0),
                "warning": by_severity.get("warning").copied().unwrap_or(0),
                "critical": by_severity.get("critical").copied().unwrap_or(0),
            },
        })
    }

    /// Alert history bucketed by time and severity, for
    /// `/api/analytics/alert-trends`.
    pub fn trends(&self, bucket_secs: i64) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let mut buckets: std::collections::BTreeMap<i64, HashMap<&'static str, usize>> =
            std::collections::BTreeMap::new();
        for a in &inner.history {
            let b = (a.timestamp / bucket_secs) * bucket_secs;
            *buckets.entry(b).or_default().entry(a.severity.as_str()).or_insert(0) += 1;
        }
        let series: Vec<_> = buckets
            .into_iter()
            .map(|(ts, counts)| {
                json!({
                    "bucket": ts,
                    "info": counts.get("info").copied().unwrap_or(0),
                    "warning": counts.get("warning").copied().unwrap_or(0),
                    "critical": counts.get("critical").copied().unwrap_or(0),
                })
            })
            .collect();
        json!({ "bucket_secs": bucket_secs, "series": series })
    }
}

// ── Delivery ──────────────────────────────────────────────────────────────────

pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Fan-out targets for fired alerts. Every channel is best-effort: a
/// failure is logged and the remaining channels still run. The MQTT
/// client is passed per delivery because the broker session comes and
/// goes independently of the engine.
pub struct AlertSinks {
    pub callback: Option<AlertCallback>,
    pub mqtt_base_topic: Option<String>,
    pub webhook: Option<(reqwest::Client, String)>,
    pub bus: Arc<EventBus>,
}

impl AlertSinks {
    pub async fn deliver(&self, alert: &Alert, mqtt: Option<&AsyncClient>) {
        if let Some(cb) = &self.callback {
            cb(alert);
        }

        let payload = serde_json::to_string(alert).unwrap_or_default();

        if let (Some(base_topic), Some(client)) = (&self.mqtt_base_topic, mqtt) {
            let severity_topic = format!("{base_topic}/{}", alert.severity.as_str());
            for topic in [base_topic.as_str(), severity_topic.as_str()] {
                if let Err(e) = client
                    .publish(topic, QoS::AtLeastOnce, false, payload.clone())
                    .await
                {
                    warn!("alert mqtt publish to {topic} failed: {e}");
                }
            }
        }

        if let Some((client, url)) = &self.webhook {
            let result = client
                .post(url)
                .json(alert)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await;
            if let Err(e) = result {
                warn!("alert webhook POST failed: {e}");
            }
        }

        self.bus.publish(Event::new(
            EventType::AlertFired,
            json!({ "data": alert }),
        ));
    }

    pub async fn deliver_all(&self, alerts: &[Alert], mqtt: Option<&AsyncClient>) {
        for alert in alerts {
            self.deliver(alert, mqtt).await;
        }
    }
}
