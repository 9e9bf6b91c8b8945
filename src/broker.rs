//! Broker sessions — short-lived bearer tokens binding a consumer to the
//! provider matchmaking chose for it.

use crate::db::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

/// Sessions live ten minutes from creation, extend-on-touch.
pub const SESSION_TTL_SECS: i64 = 600;

#[derive(Clone)]
pub struct BrokerStore {
    db: Db,
}

impl BrokerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Issue a fresh 128-bit token bound to the provider's discovery key.
    pub async fn create(&self, provider_discovery_key: &str) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let stored = token.clone();
        let provider_discovery_key = provider_discovery_key.to_string();
        self.db
            .call(move |conn| {
                let now = now_ts();
                conn.execute(
                    "INSERT INTO sessions (id, provider_discovery_key, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![stored, provider_discovery_key, now, now + SESSION_TTL_SECS],
                )?;
                Ok(())
            })
            .await?;
        Ok(token)
    }

    /// Returns the bound discovery key if the token exists and is unexpired.
    /// An expired row is deleted on the way out.
    pub async fn verify(&self, token: &str) -> Result<Option<String>> {
        let token = token.to_string();
        self.db
            .call(move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT provider_discovery_key, expires_at FROM sessions WHERE id = ?1",
                        params![token],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                match row {
                    Some((discovery_key, expires_at)) if expires_at > now_ts() => {
                        Ok(Some(discovery_key))
                    }
                    Some(_) => {
                        conn.execute("DELETE FROM sessions WHERE id = ?1", params![token])?;
                        Ok(None)
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Push expiry out another TTL. No-op for absent tokens.
    pub async fn extend(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET expires_at = ?2 WHERE id = ?1",
                    params![token, now_ts() + SESSION_TTL_SECS],
                )?;
                Ok(())
            })
            .await
    }

    /// Returns whether a row was removed.
    #[allow(dead_code)]
    pub async fn delete(&self, token: &str) -> Result<bool> {
        let token = token.to_string();
        self.db
            .call(move |conn| {
                let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![token])?;
                Ok(n > 0)
            })
            .await
    }

    /// Sweep rows whose expiry already passed. `verify` rejects them lazily;
    /// this keeps abandoned tokens from accumulating.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now_ts()])
            })
            .await
    }
}
