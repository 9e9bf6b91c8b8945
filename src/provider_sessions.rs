//! Provider session accounting — one row per continuous peer connection,
//! plus the append-only metrics checkpoints providers report against it.

use crate::db::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

/// Aggregate totals for the stats feed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub total_requests: i64,
    pub requests_today: i64,
    pub avg_duration_minutes: f64,
    pub total_duration_minutes: i64,
}

#[derive(Clone)]
pub struct ProviderSessionStore {
    db: Db,
}

impl ProviderSessionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open a session row for a freshly joined peer. Called once per peer
    /// connection. Any stray open row for the key is force-closed first so
    /// the one-open-session index holds across re-joins.
    pub async fn start(&self, peer_key: &str) -> Result<i64> {
        let peer_key = peer_key.to_string();
        self.db
            .call(move |conn| {
                let now = now_ts();
                conn.execute(
                    "UPDATE provider_sessions \
                     SET end_time = ?2, duration_minutes = (?2 - start_time) / 60 \
                     WHERE peer_key = ?1 AND end_time IS NULL",
                    params![peer_key, now],
                )?;
                conn.execute(
                    "INSERT INTO provider_sessions (peer_key, start_time) VALUES (?1, ?2)",
                    params![peer_key, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Refresh `duration_minutes` on the open row to whole minutes elapsed.
    pub async fn update_duration(&self, peer_key: &str) -> Result<()> {
        let peer_key = peer_key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE provider_sessions \
                     SET duration_minutes = (?2 - start_time) / 60 \
                     WHERE peer_key = ?1 AND end_time IS NULL",
                    params![peer_key, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    /// Close the single open row for this peer.
    pub async fn end(&self, peer_key: &str) -> Result<()> {
        let peer_key = peer_key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE provider_sessions \
                     SET end_time = ?2, duration_minutes = (?2 - start_time) / 60 \
                     WHERE peer_key = ?1 AND end_time IS NULL",
                    params![peer_key, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    /// Startup sweep: close every row a previous process left open.
    pub async fn end_orphans(&self) -> Result<usize> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE provider_sessions \
                     SET end_time = ?1, duration_minutes = (?1 - start_time) / 60 \
                     WHERE end_time IS NULL",
                    params![now_ts()],
                )
            })
            .await
    }

    pub async fn active_session_id(&self, peer_key: &str) -> Result<Option<i64>> {
        let peer_key = peer_key.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id FROM provider_sessions WHERE peer_key = ?1 AND end_time IS NULL",
                    params![peer_key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    /// Append one completion checkpoint reported by the provider.
    pub async fn add_metrics(&self, session_id: i64, state: &Value) -> Result<()> {
        let state = state.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO metrics (session_id, state, created_at) VALUES (?1, ?2, ?3)",
                    params![session_id, state, now_ts()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn log_request(&self, session_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE provider_sessions SET total_requests = total_requests + 1 WHERE id = ?1",
                    params![session_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.db
            .call(move |conn| {
                let (total_sessions, active_sessions, total_requests, avg_duration, total_duration) =
                    conn.query_row(
                        "SELECT total_sessions, active_sessions, total_requests, \
                                avg_duration_minutes, total_duration_minutes \
                         FROM session_stats",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, f64>(3)?,
                                row.get::<_, i64>(4)?,
                            ))
                        },
                    )?;
                let day_start = now_ts() - now_ts().rem_euclid(86_400);
                let requests_today: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(total_requests), 0) FROM provider_sessions \
                     WHERE start_time >= ?1",
                    params![day_start],
                    |row| row.get(0),
                )?;
                Ok(SessionStats {
                    total_sessions,
                    active_sessions,
                    total_requests,
                    requests_today,
                    avg_duration_minutes: avg_duration,
                    total_duration_minutes: total_duration,
                })
            })
            .await
    }
}
