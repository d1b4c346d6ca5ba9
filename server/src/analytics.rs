//! # analytics
//!
//! Aggregation queries over the observation history for the
//! `/api/analytics/*` surface. All SQL is parameterized; bucket widths and
//! ranges arrive pre-validated from the HTTP layer.

use serde_json::{json, Value};
use sqlx::Row;

use crate::history::HistoryStore;

/// Distinct-node counts per time bucket between `since` and `until`.
pub async fn growth(
    history: &HistoryStore,
    since: i64,
    until: i64,
    bucket_secs: i64,
) -> Result<Value, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT (timestamp / ?1) * ?1 AS bucket,
                COUNT(DISTINCT node_id) AS nodes,
                COUNT(*) AS observations
         FROM observations
         WHERE timestamp >= ?2 AND timestamp <= ?3
         GROUP BY bucket
         ORDER BY bucket ASC",
    )
    .bind(bucket_secs)
    .bind(since)
    .bind(until)
    .fetch_all(history.pool())
    .await?;

    let series: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "bucket": r.get::<i64, _>("bucket"),
                "nodes": r.get::<i64, _>("nodes"),
                "observations": r.get::<i64, _>("observations"),
            })
        })
        .collect();
    Ok(json!({ "bucket_secs": bucket_secs, "series": series }))
}

/// Hour-of-day observation histogram (UTC) between `since` and `until`.
pub async fn activity(history: &HistoryStore, since: i64, until: i64) -> Result<Value, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT CAST(strftime('%H', timestamp, 'unixepoch') AS INTEGER) AS hour,
                COUNT(*) AS observations
         FROM observations
         WHERE timestamp >= ?1 AND timestamp <= ?2
         GROUP BY hour
         ORDER BY hour ASC",
    )
    .bind(since)
    .bind(until)
    .fetch_all(history.pool())
    .await?;

    let mut hours = [0i64; 24];
    for r in &rows {
        let hour: i64 = r.get("hour");
        if (0..24).contains(&hour) {
            hours[hour as usize] = r.get("observations");
        }
    }
    Ok(json!({ "hours": hours.to_vec() }))
}

/// Most-active nodes since `since`, by observation count.
pub async fn ranking(history: &HistoryStore, since: i64, limit: i64) -> Result<Value, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT node_id, COUNT(*) AS observations,
                MIN(timestamp) AS first_seen, MAX(timestamp) AS last_seen
         FROM observations
         WHERE timestamp >= ?1
         GROUP BY node_id
         ORDER BY observations DESC, node_id ASC
         LIMIT ?2",
    )
    .bind(since)
    .bind(limit)
    .fetch_all(history.pool())
    .await?;

    let nodes: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "node_id": r.get::<String, _>("node_id"),
                "observations": r.get::<i64, _>("observations"),
                "first_seen": r.get::<i64, _>("first_seen"),
                "last_seen": r.get::<i64, _>("last_seen"),
            })
        })
        .collect();
    Ok(json!({ "nodes": nodes }))
}

/// One-shot overview since `since`.
pub async fn summary(history: &HistoryStore, since: i64) -> Result<Value, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS observations,
                COUNT(DISTINCT node_id) AS nodes,
                MIN(timestamp) AS first_seen,
                MAX(timestamp) AS last_seen
         FROM observations
         WHERE timestamp >= ?1",
    )
    .bind(since)
    .fetch_one(history.pool())
    .await?;

    let observations: i64 = row.get("observations");
    Ok(json!({
        "observations": observations,
        "nodes": row.get::<i64, _>("nodes"),
        "first_seen": if observations > 0 { Some(row.get::<i64, _>("first_seen")) } else { None },
        "last_seen": if observations > 0 { Some(row.get::<i64, _>("last_seen")) } else { None },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> HistoryStore {
        let s = HistoryStore::open_in_memory(0).await.unwrap();
        // aa: 3 observations across two buckets, bb: 1
        for ts in [100, 200, 3700] {
            s.record_observation("aa", 1.0, 1.0, ts, None, None, "meshtastic")
                .await
                .unwrap();
        }
        s.record_observation("bb", 1.0, 1.0, 150, None, None, "aredn")
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn growth_buckets_distinct_nodes() {
        let s = seeded().await;
        let g = growth(&s, 0, 10_000, 3600).await.unwrap();
        let series = g["series"].as_array().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0]["nodes"], 2);
        assert_eq!(series[0]["observations"], 3);
        assert_eq!(series[1]["nodes"], 1);
    }

    #[tokio::test]
    async fn ranking_orders_by_count() {
        let s = seeded().await;
        let r = ranking(&s, 0, 10).await.unwrap();
        let nodes = r["nodes"].as_array().unwrap();
        assert_eq!(nodes[0]["node_id"], "aa");
        assert_eq!(nodes[0]["observations"], 3);
        assert_eq!(nodes[1]["node_id"], "bb");
    }

    #[tokio::test]
    async fn summary_counts() {
        let s = seeded().await;
        let v = summary(&s, 0).await.unwrap();
        assert_eq!(v["observations"], 4);
        assert_eq!(v["nodes"], 2);
        assert_eq!(v["first_seen"], 100);

        let empty = summary(&s, 1_000_000).await.unwrap();
        assert_eq!(empty["observations"], 0);
        assert!(empty["first_seen"].is_null());
    }

    #[tokio::test]
    async fn activity_histogram_has_24_slots() {
        let s = seeded().await;
        let a = activity(&s, 0, 10_000).await.unwrap();
        let hours = a["hours"].as_array().unwrap();
        assert_eq!(hours.len(), 24);
        // ts 100/150/200 land in hour 0, ts 3700 in hour 1
        assert_eq!(hours[0], 3);
        assert_eq!(hours[1], 1);
    }
}
