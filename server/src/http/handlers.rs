//! Route handlers for the documented API surface. Everything reads
//! through the owning components' public accessors; parameters are
//! validated here and nowhere deeper.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use mesh_model::{validate_node_id, Network};

use super::{ApiError, SharedState};
use crate::alerts::Severity;
use crate::analytics;
use crate::breaker::BreakerState;
use crate::drift::DriftSeverity;
use crate::util::{now_ts, round1};

type Params = Query<HashMap<String, String>>;

const LIMIT_MAX: i64 = 10_000;

// ── Parameter helpers ─────────────────────────────────────────────────────────

/// Optional integer query parameter; absent and empty are both "missing",
/// anything unparsable is a 400.
fn q_i64(params: &HashMap<String, String>, key: &str) -> Result<Option<i64>, ApiError> {
    match params.get(key).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid {key}: {raw:?}"))),
    }
}

fn q_limit(params: &HashMap<String, String>, default: i64) -> Result<i64, ApiError> {
    Ok(q_i64(params, "limit")?.unwrap_or(default).clamp(1, LIMIT_MAX))
}

fn path_node_id(raw: &str) -> Result<String, ApiError> {
    validate_node_id(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

// ── Pages ─────────────────────────────────────────────────────────────────────

const CSP: &str = "default-src 'self'; script-src 'self' https://unpkg.com; \
                   style-src 'self' 'unsafe-inline' https://unpkg.com; \
                   img-src 'self' data: https:; connect-src 'self' ws: wss:";

const INDEX_HTML: &str = include_str!("map.html");

pub async fn index() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CONTENT_SECURITY_POLICY, CSP),
        ],
        INDEX_HTML,
    )
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("no such route")
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub async fn nodes_geojson(State(state): State<SharedState>) -> Json<Value> {
    Json(state.aggregator.geojson(None))
}

pub async fn nodes_by_source(
    State(state): State<SharedState>,
    Path(source): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let network = Network::parse(&source)
        .ok_or_else(|| ApiError::bad_request(format!("unknown source {source:?}")))?;
    Ok(Json(state.aggregator.geojson(Some(network))))
}

pub async fn node_trajectory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let id = path_node_id(&id)?;
    let since = q_i64(&params, "since")?.unwrap_or(0);
    let until = q_i64(&params, "until")?.unwrap_or_else(now_ts);
    let doc = state.history.trajectory_geojson(&id, since, until).await?;
    Ok(Json(doc))
}

pub async fn node_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let id = path_node_id(&id)?;
    let since = q_i64(&params, "since")?.unwrap_or(0);
    let limit = q_limit(&params, 100)?;
    let rows = state.history.get_node_history(&id, since, limit).await?;
    Ok(Json(json!(rows)))
}

pub async fn node_health(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = path_node_id(&id)?;
    match state.health.get(&id) {
        Some(report) => Ok(Json(json!({
            "node_id": id,
            "score": round1(report.score),
            "status": report.status,
            "components": report.components,
        }))),
        None => Err(ApiError::not_found(format!("no health data for {id}"))),
    }
}

// ── Topology & overlays ───────────────────────────────────────────────────────

pub async fn topology(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "links": state.aggregator.topology() }))
}

pub async fn topology_geojson(State(state): State<SharedState>) -> Json<Value> {
    let links = state.aggregator.topology();
    let features: Vec<Value> = {
        // Edge endpoints resolve through current node geometry
        let nodes: HashMap<String, (f64, f64)> = state
            .aggregator
            .features()
            .into_iter()
            .filter_map(|f| f.geometry.map(|p| (f.id, (p.lat, p.lon))))
            .collect();
        links
            .iter()
            .filter_map(|link| {
                let (slat, slon) = nodes.get(&link.source)?;
                let (tlat, tlon) = nodes.get(&link.target)?;
                Some(json!({
                    "type": "Feature",
                    "geometry": {
                        "type": "LineString",
                        "coordinates": [[slon, slat], [tlon, tlat]],
                    },
                    "properties": {
                        "source": link.source,
                        "target": link.target,
                        "snr": link.snr,
                        "quality": link.quality,
                        "color": link.color,
                        "network": link.network,
                    },
                }))
            })
            .collect()
    };
    Json(json!({ "type": "FeatureCollection", "features": features }))
}

pub async fn overlay(State(state): State<SharedState>) -> Json<Value> {
    Json(Value::Object(state.aggregator.overlay()))
}

pub async fn hamclock(State(state): State<SharedState>) -> Json<Value> {
    let overlay = state.aggregator.overlay();
    Json(json!({
        "available": !overlay.is_empty(),
        "propagation": Value::Object(overlay),
    }))
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn node_health_all(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "nodes": state.health.all() }))
}

pub async fn node_health_summary(State(state): State<SharedState>) -> Json<Value> {
    Json(state.health.summary())
}

/// Whole-system 0–100 score: enabled sources up, breakers closed, broker
/// session alive.
pub async fn system_health(State(state): State<SharedState>) -> Json<Value> {
    let mut score: f64 = 100.0;
    let mut notes = Vec::new();

    for (source, ok) in state.aggregator.source_status() {
        if !ok {
            score -= 15.0;
            notes.push(format!("source {source} down"));
        }
    }
    for breaker in state.breakers.snapshot_all() {
        if breaker.state != BreakerState::Closed {
            score -= 10.0;
            notes.push(format!("breaker {} {:?}", breaker.name, breaker.state));
        }
    }
    if let Some(subscriber) = &state.subscriber {
        if !subscriber.is_connected() {
            score -= 10.0;
            notes.push("mqtt disconnected".to_string());
        }
    }

    let score = score.clamp(0.0, 100.0);
    Json(json!({
        "score": score,
        "status": crate::health::status_label(score),
        "notes": notes,
    }))
}

pub async fn status(State(state): State<SharedState>) -> Json<Value> {
    let snapshot = state.aggregator.snapshot();
    let mut body = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": now_ts() - state.started_at,
        "nodes": snapshot.features.len(),
        "collected_at": snapshot.collected_at,
        "sources": snapshot.source_ok,
        "collectors": state.aggregator.collector_health(),
        "event_bus": state.bus.stats(),
        "circuit_breakers": state.breakers.snapshot_all(),
        "leases": state.leases.stats(),
    });
    if let Some(ws) = &state.ws {
        body["ws"] = ws.status();
    }
    Json(body)
}

pub async fn perf(State(state): State<SharedState>) -> Json<Value> {
    Json(state.perf.report(&state.aggregator.cache_hit_ratios()))
}

// ── Connectivity & drift ──────────────────────────────────────────────────────

pub async fn node_states(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "nodes": state.connectivity.states() }))
}

pub async fn node_states_summary(State(state): State<SharedState>) -> Json<Value> {
    Json(json!(state.connectivity.summary()))
}

pub async fn config_drift(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let since = q_i64(&params, "since")?;
    let severity = match params.get("severity").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            DriftSeverity::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid severity {raw:?}")))?,
        ),
    };
    Ok(Json(json!({ "drifts": state.drift.drifts(since, severity) })))
}

pub async fn mqtt_stats(State(state): State<SharedState>) -> Json<Value> {
    match &state.subscriber {
        Some(subscriber) => Json(subscriber.stats()),
        None => Json(json!({ "enabled": false })),
    }
}

// ── Alerts ────────────────────────────────────────────────────────────────────

pub async fn alerts(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let severity = match params.get("severity").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            Severity::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid severity {raw:?}")))?,
        ),
    };
    let node_id = match params.get("node_id").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(path_node_id(raw)?),
    };
    let limit = q_limit(&params, 100)?;
    let alerts = state
        .alerts
        .alerts(severity, node_id.as_deref(), limit as usize);
    Ok(Json(json!({ "alerts": alerts })))
}

pub async fn alerts_active(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "alerts": state.alerts.active() }))
}

pub async fn alert_rules(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "rules": state.alerts.rules() }))
}

pub async fn alerts_summary(State(state): State<SharedState>) -> Json<Value> {
    let mut body = state.alerts.summary();
    if let Some(subscriber) = &state.subscriber {
        body["mqtt"] = subscriber.stats();
    }
    Json(body)
}

pub async fn alert_acknowledge(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let alert_id: u64 = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid alert id {id:?}")))?;
    if state.alerts.acknowledge(alert_id) {
        Ok(Json(json!({ "acknowledged": alert_id })))
    } else {
        Err(ApiError::not_found(format!("no alert {alert_id}")))
    }
}

// ── Analytics ─────────────────────────────────────────────────────────────────

pub async fn analytics_growth(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let since = q_i64(&params, "since")?.unwrap_or(0);
    let until = q_i64(&params, "until")?.unwrap_or_else(now_ts);
    let bucket = q_i64(&params, "bucket")?.unwrap_or(3600).clamp(60, 86_400 * 7);
    Ok(Json(analytics::growth(&state.history, since, until, bucket).await?))
}

pub async fn analytics_activity(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let since = q_i64(&params, "since")?.unwrap_or(0);
    let until = q_i64(&params, "until")?.unwrap_or_else(now_ts);
    Ok(Json(analytics::activity(&state.history, since, until).await?))
}

pub async fn analytics_ranking(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let since = q_i64(&params, "since")?.unwrap_or(0);
    let limit = q_limit(&params, 20)?;
    Ok(Json(analytics::ranking(&state.history, since, limit).await?))
}

pub async fn analytics_summary(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let since = q_i64(&params, "since")?.unwrap_or(0);
    Ok(Json(analytics::summary(&state.history, since).await?))
}

pub async fn analytics_alert_trends(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let bucket = q_i64(&params, "bucket")?.unwrap_or(3600).clamp(60, 86_400 * 7);
    Ok(Json(state.alerts.trends(bucket)))
}

// ── Config & meta ─────────────────────────────────────────────────────────────

pub async fn config(State(state): State<SharedState>) -> Json<Value> {
    Json(state.config.redacted())
}

pub async fn tile_providers(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "providers": state.config.tile_providers }))
}

pub async fn sources(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "enabled": state.config.enabled_sources(),
        "status": state.aggregator.source_status(),
    }))
}
