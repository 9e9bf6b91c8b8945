//! Fixed-window request counting per client IP, backing the HTTP 429 path.

use crate::db::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

/// HTTP requests allowed per IP per window.
pub const MAX_HTTP_REQUESTS: i64 = 100;
/// Window length consulted by the HTTP front door.
pub const TIME_WINDOW_MINUTES: i64 = 60;

#[derive(Clone)]
pub struct IpLimitStore {
    db: Db,
}

impl IpLimitStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Count one message from this IP: insert-or-increment, refreshing
    /// `last_seen`.
    pub async fn record(&self, ip: &str) -> Result<()> {
        let ip = ip.to_string();
        self.db
            .call(move |conn| {
                let now = now_ts();
                conn.execute(
                    "INSERT INTO ip_messages (ip_address, message_count, first_seen, last_seen) \
                     VALUES (?1, 1, ?2, ?2) \
                     ON CONFLICT(ip_address) DO UPDATE SET \
                         message_count = message_count + 1, \
                         last_seen = excluded.last_seen",
                    params![ip, now],
                )?;
                Ok(())
            })
            .await
    }

    /// The accumulated count and last-seen time, if the IP was seen within
    /// the window. Returns nothing for IPs seen only before the window.
    pub async fn get_in_window(
        &self,
        ip: &str,
        window_minutes: i64,
    ) -> Result<Option<(i64, i64)>> {
        let ip = ip.to_string();
        self.db
            .call(move |conn| {
                let cutoff = now_ts() - window_minutes * 60;
                conn.query_row(
                    "SELECT message_count, last_seen FROM ip_messages \
                     WHERE ip_address = ?1 AND last_seen >= ?2",
                    params![ip, cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_db;

    #[tokio::test]
    async fn test_record_increments() {
        let (db, _dir) = temp_db().await;
        let store = IpLimitStore::new(db);
        for _ in 0..3 {
            store.record("10.0.0.1").await.unwrap();
        }
        let (count, _) = store
            .get_in_window("10.0.0.1", TIME_WINDOW_MINUTES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_unknown_ip_is_unseen() {
        let (db, _dir) = temp_db().await;
        let store = IpLimitStore::new(db);
        assert!(store
            .get_in_window("10.0.0.9", TIME_WINDOW_MINUTES)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_window_excludes_stale_rows() {
        let (db, _dir) = temp_db().await;
        let store = IpLimitStore::new(db.clone());
        store.record("10.0.0.1").await.unwrap();
        db.call(|conn| {
            conn.execute("UPDATE ip_messages SET last_seen = last_seen - 3700", [])?;
            Ok(())
        })
        .await
        .unwrap();

        assert!(store
            .get_in_window("10.0.0.1", TIME_WINDOW_MINUTES)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_hundredth_allowed_hundred_first_limited() {
        let (db, _dir) = temp_db().await;
        let store = IpLimitStore::new(db);
        // Check-then-record, the way the front door consults the store.
        for i in 1..=100 {
            let seen = store
                .get_in_window("10.0.0.1", TIME_WINDOW_MINUTES)
                .await
                .unwrap()
                .map(|(count, _)| count)
                .unwrap_or(0);
            assert!(seen < MAX_HTTP_REQUESTS, "request {i} must pass");
            store.record("10.0.0.1").await.unwrap();
        }
        let (count, _) = store
            .get_in_window("10.0.0.1", TIME_WINDOW_MINUTES)
            .await
            .unwrap()
            .unwrap();
        assert!(count >= MAX_HTTP_REQUESTS, "the 101st request must be refused");
    }
}
