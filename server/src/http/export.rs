//! CSV and JSON export endpoints, with a proper CSV escaper.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use super::{ApiError, SharedState};
use crate::analytics;
use crate::util::now_ts;

type Params = Query<HashMap<String, String>>;

// ── CSV primitives ────────────────────────────────────────────────────────────

/// RFC 4180 field escaping: quote when the value contains a comma, quote,
/// or newline; embedded quotes double.
pub fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => csv_escape(s),
        other => csv_escape(&other.to_string()),
    }
}

fn csv_document(header: &[&str], rows: &[Vec<Value>]) -> String {
    let mut out = header.join(",");
    out.push('\n');
    for row in rows {
        let line: Vec<String> = row.iter().map(csv_value).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn csv_response(filename: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response()
}

fn wants_csv(params: &HashMap<String, String>) -> Result<bool, ApiError> {
    match params.get("format").map(String::as_str) {
        None | Some("") | Some("csv") => Ok(true),
        Some("json") => Ok(false),
        Some(other) => Err(ApiError::bad_request(format!("unknown format {other:?}"))),
    }
}

// ── Exports ───────────────────────────────────────────────────────────────────

pub async fn export_nodes(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let features = state.aggregator.features();
    if !wants_csv(&params)? {
        let docs: Vec<Value> = features.iter().map(|f| f.to_geojson()).collect();
        return Ok(Json(json!({ "nodes": docs })).into_response());
    }

    let rows: Vec<Vec<Value>> = features
        .iter()
        .map(|f| {
            vec![
                json!(f.id),
                f.properties.get("network").cloned().unwrap_or(Value::Null),
                f.properties.get("name").cloned().unwrap_or(Value::Null),
                f.geometry.map(|p| json!(p.lat)).unwrap_or(Value::Null),
                f.geometry.map(|p| json!(p.lon)).unwrap_or(Value::Null),
                f.properties.get("battery").cloned().unwrap_or(Value::Null),
                f.properties.get("snr").cloned().unwrap_or(Value::Null),
                f.properties.get("last_seen").cloned().unwrap_or(Value::Null),
                f.properties.get("is_online").cloned().unwrap_or(Value::Null),
            ]
        })
        .collect();
    let body = csv_document(
        &["id", "network", "name", "lat", "lon", "battery", "snr", "last_seen", "is_online"],
        &rows,
    );
    Ok(csv_response("meshforge_nodes.csv", body))
}

pub async fn export_alerts(
    State(state): State<SharedState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let alerts = state.alerts.alerts(None, None, 10_000);
    if !wants_csv(&params)? {
        return Ok(Json(json!({ "alerts": alerts })).into_response());
    }

    let rows: Vec<Vec<Value>> = alerts
        .iter()
        .map(|a| {
            vec![
                json!(a.alert_id),
                json!(a.rule_id),
                json!(a.node_id),
                json!(a.metric),
                json!(a.value),
                json!(a.threshold),
                json!(a.severity.as_str()),
                json!(a.message),
                json!(a.timestamp),
                json!(a.acknowledged),
            ]
        })
        .collect();
    let body = csv_document(
        &[
            "alert_id", "rule_id", "node_id", "metric", "value", "threshold", "severity",
            "message", "timestamp", "acknowledged",
        ],
        &rows,
    );
    Ok(csv_response("meshforge_alerts.csv", body))
}

pub async fn export_analytics(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let since = params
        .get("since")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let until = now_ts();

    let (filename, header, rows): (&str, Vec<&str>, Vec<Vec<Value>>) = match kind.as_str() {
        "growth" => {
            let doc = analytics::growth(&state.history, since, until, 3600).await?;
            let rows = doc["series"]
                .as_array()
                .map(|series| {
                    series
                        .iter()
                        .map(|b| vec![b["bucket"].clone(), b["nodes"].clone(), b["observations"].clone()])
                        .collect()
                })
                .unwrap_or_default();
            ("meshforge_growth.csv", vec!["bucket", "nodes", "observations"], rows)
        }
        "activity" => {
            let doc = analytics::activity(&state.history, since, until).await?;
            let rows = doc["hours"]
                .as_array()
                .map(|hours| {
                    hours
                        .iter()
                        .enumerate()
                        .map(|(hour, count)| vec![json!(hour), count.clone()])
                        .collect()
                })
                .unwrap_or_default();
            ("meshforge_activity.csv", vec!["hour", "observations"], rows)
        }
        "ranking" => {
            let doc = analytics::ranking(&state.history, since, 1000).await?;
            let rows = doc["nodes"]
                .as_array()
                .map(|nodes| {
                    nodes
                        .iter()
                        .map(|n| {
                            vec![
                                n["node_id"].clone(),
                                n["observations"].clone(),
                                n["first_seen"].clone(),
                                n["last_seen"].clone(),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            (
                "meshforge_ranking.csv",
                vec!["node_id", "observations", "first_seen", "last_seen"],
                rows,
            )
        }
        other => return Err(ApiError::bad_request(format!("unknown analytics kind {other:?}"))),
    };

    Ok(csv_response(filename, csv_document(&header, &rows)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaper_handles_specials() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn document_layout() {
        let rows = vec![
            vec![json!("aa"), json!(1.5), Value::Null],
            vec![json!("b,b"), json!(0), json!(true)],
        ];
        let doc = csv_document(&["id", "value", "flag"], &rows);
        let lines: Vec<&str> = doc.lines().collect();
        assert_eq!(lines[0], "id,value,flag");
        assert_eq!(lines[1], "aa,1.5,");
        assert_eq!(lines[2], "\"b,b\",0,true");
    }
}
