//! Durable record of known providers and the matchmaking queries over them.

use crate::db::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub key: String,
    pub discovery_key: String,
    pub model_name: String,
    pub api_provider: Option<String>,
    pub name: Option<String>,
    pub website: Option<String>,
    pub public: bool,
    pub data_collection_enabled: bool,
    pub server_key: Option<String>,
    pub max_connections: u32,
    pub connections: u32,
    pub online: bool,
    pub healthy: bool,
    pub points: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Self-description captured from a `join` frame, keyed by the transport
/// public key of the connection it arrived on.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub key: String,
    pub discovery_key: String,
    pub model_name: String,
    pub api_provider: Option<String>,
    pub name: Option<String>,
    pub website: Option<String>,
    pub public: bool,
    pub data_collection_enabled: bool,
    pub server_key: Option<String>,
    pub max_connections: u32,
}

/// Peer row joined with session counts and request totals, for stats pages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerOverviewRow {
    #[serde(flatten)]
    pub peer: PeerRecord,
    pub session_count: i64,
    pub total_requests: i64,
    pub metric_count: i64,
}

#[derive(Clone)]
pub struct PeerStore {
    db: Db,
}

const PEER_COLUMNS: &str = "key, discovery_key, model_name, api_provider, name, website, \
     public, data_collection_enabled, server_key, max_connections, connections, \
     online, healthy, points, created_at, updated_at";

impl PeerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert-or-replace by key. Preserves points and accumulated counters;
    /// forces `online` and refreshes `updated_at`.
    pub async fn upsert(&self, peer: NewPeer) -> Result<()> {
        self.db
            .call(move |conn| {
                let now = now_ts();
                conn.execute(
                    r#"
                    INSERT INTO peers (
                        key, discovery_key, model_name, api_provider, name, website,
                        public, data_collection_enabled, server_key, max_connections,
                        connections, online, healthy, points, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 1, 1, 0, ?11, ?11)
                    ON CONFLICT(key) DO UPDATE SET
                        discovery_key = excluded.discovery_key,
                        model_name = excluded.model_name,
                        api_provider = excluded.api_provider,
                        name = excluded.name,
                        website = excluded.website,
                        public = excluded.public,
                        data_collection_enabled = excluded.data_collection_enabled,
                        server_key = excluded.server_key,
                        max_connections = excluded.max_connections,
                        online = 1,
                        healthy = 1,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        peer.key,
                        peer.discovery_key,
                        peer.model_name,
                        peer.api_provider,
                        peer.name,
                        peer.website,
                        peer.public as i64,
                        peer.data_collection_enabled as i64,
                        peer.server_key,
                        peer.max_connections,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_offline(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE peers SET online = 0, updated_at = ?2 WHERE key = ?1",
                    params![key, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_healthy(&self, key: &str, healthy: bool) -> Result<()> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE peers SET healthy = ?2, updated_at = ?3 WHERE key = ?1",
                    params![key, healthy as i64, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    /// Record the connection fan-out a provider self-reported.
    pub async fn update_connections(&self, key: &str, connections: u32) -> Result<()> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE peers SET connections = ?2, updated_at = ?3 WHERE key = ?1",
                    params![key, connections, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Option<PeerRecord>> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {PEER_COLUMNS} FROM peers WHERE key = ?1"),
                    params![key],
                    map_peer_row,
                )
                .optional()
            })
            .await
    }

    pub async fn get_by_discovery_key(&self, discovery_key: &str) -> Result<Option<PeerRecord>> {
        let discovery_key = discovery_key.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {PEER_COLUMNS} FROM peers WHERE discovery_key = ?1"),
                    params![discovery_key],
                    map_peer_row,
                )
                .optional()
            })
            .await
    }

    /// Uniformly random online provider for the model, if any.
    pub async fn get_random(&self, model_name: &str) -> Result<Option<PeerRecord>> {
        let model_name = model_name.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {PEER_COLUMNS} FROM peers \
                         WHERE online = 1 AND model_name = ?1 \
                         ORDER BY RANDOM() LIMIT 1"
                    ),
                    params![model_name],
                    map_peer_row,
                )
                .optional()
            })
            .await
    }

    /// Startup reset: no peer is connected to a freshly started hub.
    pub async fn reset_all_connections(&self) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE peers SET online = 0, connections = 0, updated_at = ?1",
                    params![now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    /// Joined read for stats pages: every peer with its session count,
    /// accumulated request total, and reported metric checkpoints.
    pub async fn get_all(&self) -> Result<Vec<PeerOverviewRow>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {cols}, COALESCE(s.session_count, 0), COALESCE(s.total_requests, 0), \
                            COALESCE(m.metric_count, 0) \
                     FROM peers p \
                     LEFT JOIN ( \
                         SELECT peer_key, COUNT(*) AS session_count, \
                                SUM(total_requests) AS total_requests \
                         FROM provider_sessions GROUP BY peer_key \
                     ) s ON s.peer_key = p.key \
                     LEFT JOIN ( \
                         SELECT ps.peer_key, COUNT(*) AS metric_count \
                         FROM metrics mt \
                         INNER JOIN provider_sessions ps ON ps.id = mt.session_id \
                         GROUP BY ps.peer_key \
                     ) m ON m.peer_key = p.key \
                     ORDER BY p.created_at ASC",
                    cols = PEER_COLUMNS
                        .split(", ")
                        .map(|c| format!("p.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(PeerOverviewRow {
                            peer: map_peer_row(row)?,
                            session_count: row.get(16)?,
                            total_requests: row.get(17)?,
                            metric_count: row.get(18)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Hard delete. Returns whether a row existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                let n = conn.execute("DELETE FROM peers WHERE key = ?1", params![key])?;
                Ok(n > 0)
            })
            .await
    }
}

fn map_peer_row(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    Ok(PeerRecord {
        key: row.get(0)?,
        discovery_key: row.get(1)?,
        model_name: row.get(2)?,
        api_provider: row.get(3)?,
        name: row.get(4)?,
        website: row.get(5)?,
        public: row.get::<_, i64>(6)? != 0,
        data_collection_enabled: row.get::<_, i64>(7)? != 0,
        server_key: row.get(8)?,
        max_connections: row.get(9)?,
        connections: row.get(10)?,
        online: row.get::<_, i64>(11)? != 0,
        healthy: row.get::<_, i64>(12)? != 0,
        points: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}
