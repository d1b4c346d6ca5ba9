//! # history
//!
//! Durable node position history in a single-file SQLite database.
//!
//! Observations are append-only and throttled per node: a second write
//! inside the throttle window is a silent no-op. The throttle check and
//! the insert run under one lock so concurrent writers cannot slip in a
//! duplicate. Every query is parameterized; ordering is always
//! `(timestamp ASC, id ASC)` with the monotonic primary key breaking
//! timestamp ties.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub id: i64,
    pub node_id: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    pub network: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedNode {
    pub node_id: String,
    pub observation_count: i64,
    pub first_seen: i64,
    pub last_seen: i64,
}

pub struct HistoryStore {
    pool: SqlitePool,
    throttle_secs: i64,
    /// node_id → last recorded timestamp; guards the throttle+insert pair.
    last_recorded: Mutex<HashMap<String, i64>>,
}

fn row_to_observation(row: &sqlx::sqlite::SqliteRow) -> Observation {
    Observation {
        id: row.get("id"),
        node_id: row.get("node_id"),
        lat: row.get("lat"),
        lon: row.get("lon"),
        timestamp: row.get("timestamp"),
        snr: row.get("snr"),
        battery: row.get("battery"),
        network: row.get("network"),
    }
}

impl HistoryStore {
    pub async fn open(path: &Path, throttle_secs: i64) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool, throttle_secs).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory(throttle_secs: i64) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool, throttle_secs).await
    }

    async fn init(pool: SqlitePool, throttle_secs: i64) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS observations (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id   TEXT NOT NULL,
                lat       REAL NOT NULL,
                lon       REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                snr       REAL,
                battery   REAL,
                network   TEXT NOT NULL DEFAULT 'meshtastic'
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_observations_node_ts
             ON observations (node_id, timestamp)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_observations_ts
             ON observations (timestamp)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            throttle_secs,
            last_recorded: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one observation unless the node wrote inside the throttle
    /// window. Returns whether a row was inserted.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_observation(
        &self,
        node_id: &str,
        lat: f64,
        lon: f64,
        timestamp: i64,
        snr: Option<f64>,
        battery: Option<f64>,
        network: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut last = self.last_recorded.lock().await;
        if let Some(&prev) = last.get(node_id) {
            if timestamp - prev < self.throttle_secs {
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO observations (node_id, lat, lon, timestamp, snr, battery, network)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(node_id)
        .bind(lat)
        .bind(lon)
        .bind(timestamp)
        .bind(snr)
        .bind(battery)
        .bind(network)
        .execute(&self.pool)
        .await?;

        last.insert(node_id.to_string(), timestamp);
        Ok(true)
    }

    /// Ordered position track for one node.
    pub async fn get_trajectory(
        &self,
        node_id: &str,
        since: i64,
        until: i64,
    ) -> Result<Vec<Observation>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, node_id, lat, lon, timestamp, snr, battery, network
             FROM observations
             WHERE node_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(node_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_observation).collect())
    }

    /// The trajectory as a GeoJSON LineString feature.
    pub async fn trajectory_geojson(
        &self,
        node_id: &str,
        since: i64,
        until: i64,
    ) -> Result<Value, sqlx::Error> {
        let track = self.get_trajectory(node_id, since, until).await?;
        let coordinates: Vec<Value> = track.iter().map(|o| json!([o.lon, o.lat])).collect();
        let timestamps: Vec<i64> = track.iter().map(|o| o.timestamp).collect();
        Ok(json!({
            "type": "Feature",
            "id": node_id,
            "geometry": { "type": "LineString", "coordinates": coordinates },
            "properties": { "node_id": node_id, "timestamps": timestamps, "points": track.len() },
        }))
    }

    /// The most recent `limit` observations at or after `since`, reported
    /// oldest-first.
    pub async fn get_node_history(
        &self,
        node_id: &str,
        since: i64,
        limit: i64,
    ) -> Result<Vec<Observation>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, node_id, lat, lon, timestamp, snr, battery, network
             FROM observations
             WHERE node_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC, id DESC
             LIMIT ?3",
        )
        .bind(node_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut out: Vec<Observation> = rows.iter().map(row_to_observation).collect();
        out.reverse();
        Ok(out)
    }

    pub async fn get_tracked_nodes(&self) -> Result<Vec<TrackedNode>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT node_id, COUNT(*) AS observation_count,
                    MIN(timestamp) AS first_seen, MAX(timestamp) AS last_seen
             FROM observations
             GROUP BY node_id
             ORDER BY node_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| TrackedNode {
                node_id: row.get("node_id"),
                observation_count: row.get("observation_count"),
                first_seen: row.get("first_seen"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    /// For every tracked node, its latest observation at or before
    /// `timestamp`. The monotonic id breaks timestamp ties so a node can
    /// never appear twice.
    pub async fn get_snapshot(&self, timestamp: i64) -> Result<Vec<Observation>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, node_id, lat, lon, timestamp, snr, battery, network
             FROM observations o
             WHERE o.id = (
                 SELECT o2.id FROM observations o2
                 WHERE o2.node_id = o.node_id AND o2.timestamp <= ?1
                 ORDER BY o2.timestamp DESC, o2.id DESC
                 LIMIT 1
             )
             ORDER BY node_id ASC",
        )
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_observation).collect())
    }

    /// Delete observations older than `older_than`. Returns rows removed.
    pub async fn prune_old_data(&self, older_than: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM observations WHERE timestamp < ?1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn observation_count(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> HistoryStore {
        HistoryStore::open_in_memory(60).await.unwrap()
    }

    #[tokio::test]
    async fn throttle_suppresses_rapid_writes() {
        let s = store().await;
        assert!(s
            .record_observation("aa", 1.0, 2.0, 1000, None, None, "meshtastic")
            .await
            .unwrap());
        assert!(!s
            .record_observation("aa", 1.1, 2.1, 1030, None, None, "meshtastic")
            .await
            .unwrap());
        assert_eq!(s.observation_count().await.unwrap(), 1);

        assert!(s
            .record_observation("aa", 1.2, 2.2, 1060, None, None, "meshtastic")
            .await
            .unwrap());
        assert_eq!(s.observation_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn throttle_is_per_node() {
        let s = store().await;
        s.record_observation("aa", 1.0, 2.0, 1000, None, None, "meshtastic")
            .await
            .unwrap();
        assert!(s
            .record_observation("bb", 1.0, 2.0, 1001, None, None, "aredn")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn trajectory_is_time_ordered() {
        let s = store().await;
        for (ts, lat) in [(300, 3.0), (100, 1.0), (200, 2.0)] {
            s.record_observation("aa", lat, 0.5, ts, None, None, "meshtastic")
                .await
                .unwrap();
        }
        let track = s.get_trajectory("aa", 0, 1000).await.unwrap();
        let ts: Vec<i64> = track.iter().map(|o| o.timestamp).collect();
        assert_eq!(ts, vec![100, 200, 300]);

        let geo = s.trajectory_geojson("aa", 0, 1000).await.unwrap();
        assert_eq!(geo["geometry"]["type"], "LineString");
        assert_eq!(geo["geometry"]["coordinates"][0], json!([0.5, 1.0]));
    }

    #[tokio::test]
    async fn snapshot_disambiguates_by_primary_key() {
        let s = HistoryStore::open_in_memory(0).await.unwrap();
        for ts in [100, 200, 300] {
            s.record_observation("aa", ts as f64, 0.0, ts, None, None, "meshtastic")
                .await
                .unwrap();
        }
        for ts in [150, 250] {
            s.record_observation("bb", ts as f64, 0.0, ts, None, None, "meshtastic")
                .await
                .unwrap();
        }

        let snap = s.get_snapshot(220).await.unwrap();
        assert_eq!(snap.len(), 2);
        let a = snap.iter().find(|o| o.node_id == "aa").unwrap();
        let b = snap.iter().find(|o| o.node_id == "bb").unwrap();
        assert_eq!(a.timestamp, 200);
        assert_eq!(b.timestamp, 150);

        // Duplicate timestamps resolve to the newest insert
        s.record_observation("aa", 99.0, 0.0, 300, None, None, "meshtastic")
            .await
            .unwrap();
        let snap = s.get_snapshot(400).await.unwrap();
        let a = snap.iter().find(|o| o.node_id == "aa").unwrap();
        assert_eq!(a.lat, 99.0);
    }

    #[tokio::test]
    async fn history_limit_and_order() {
        let s = HistoryStore::open_in_memory(0).await.unwrap();
        for ts in 1..=10i64 {
            s.record_observation("aa", ts as f64, 0.0, ts * 100, None, None, "meshtastic")
                .await
                .unwrap();
        }
        let recent = s.get_node_history("aa", 0, 3).await.unwrap();
        let ts: Vec<i64> = recent.iter().map(|o| o.timestamp).collect();
        // The three newest, oldest-first
        assert_eq!(ts, vec![800, 900, 1000]);
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let s = HistoryStore::open_in_memory(0).await.unwrap();
        s.record_observation("aa", 1.0, 1.0, 100, None, None, "meshtastic")
            .await
            .unwrap();
        s.record_observation("aa", 1.0, 1.0, 5000, None, None, "meshtastic")
            .await
            .unwrap();
        let removed = s.prune_old_data(1000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(s.observation_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tracked_nodes_aggregate() {
        let s = HistoryStore::open_in_memory(0).await.unwrap();
        for ts in [100, 200] {
            s.record_observation("aa", 1.0, 1.0, ts, Some(3.5), Some(80.0), "meshtastic")
                .await
                .unwrap();
        }
        let tracked = s.get_tracked_nodes().await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].observation_count, 2);
        assert_eq!(tracked[0].first_seen, 100);
        assert_eq!(tracked[0].last_seen, 200);
    }
}
