use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF_MS: u64 = 100;
const MMAP_SIZE_BYTES: i64 = 268_435_456;

/// Numbered schema migrations, applied in ascending id order at startup.
/// One row per applied id lands in the `migrations` table.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE peers (
            key TEXT PRIMARY KEY,
            discovery_key TEXT NOT NULL UNIQUE,
            model_name TEXT NOT NULL DEFAULT '',
            api_provider TEXT,
            name TEXT,
            website TEXT,
            public INTEGER NOT NULL DEFAULT 0,
            data_collection_enabled INTEGER NOT NULL DEFAULT 0,
            server_key TEXT,
            max_connections INTEGER NOT NULL DEFAULT 1,
            connections INTEGER NOT NULL DEFAULT 0,
            online INTEGER NOT NULL DEFAULT 0,
            healthy INTEGER NOT NULL DEFAULT 1,
            points INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX idx_peers_model_online ON peers (model_name, online);
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            provider_discovery_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX idx_sessions_expiry ON sessions (expires_at);
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE provider_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_key TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            duration_minutes INTEGER NOT NULL DEFAULT 0,
            total_requests INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX idx_provider_sessions_open
            ON provider_sessions (peer_key) WHERE end_time IS NULL;
        CREATE INDEX idx_provider_sessions_peer ON provider_sessions (peer_key);
        "#,
    ),
    (
        4,
        r#"
        CREATE TABLE metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES provider_sessions(id),
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_metrics_session ON metrics (session_id);
        "#,
    ),
    (
        5,
        r#"
        CREATE TABLE ip_messages (
            ip_address TEXT PRIMARY KEY,
            message_count INTEGER NOT NULL DEFAULT 0,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );
        "#,
    ),
    (
        6,
        r#"
        CREATE VIEW session_stats AS
        SELECT
            COUNT(*) AS total_sessions,
            COALESCE(SUM(CASE WHEN end_time IS NULL THEN 1 ELSE 0 END), 0) AS active_sessions,
            COALESCE(SUM(total_requests), 0) AS total_requests,
            COALESCE(AVG(duration_minutes), 0.0) AS avg_duration_minutes,
            COALESCE(SUM(duration_minutes), 0) AS total_duration_minutes
        FROM provider_sessions;
        "#,
    ),
];

/// Handle to the relational store. Cheap to clone; every store owns one and
/// runs its statements on the blocking pool.
#[derive(Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub async fn open(data_dir: &Path) -> Result<Db> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("symmetry.db");
        let init_path = path.clone();
        tokio::task::spawn_blocking(move || init_db(&init_path)).await??;
        Ok(Db { path })
    }

    /// Run one store operation, retrying transient busy/locked errors with
    /// exponential backoff (5 attempts, 100 ms doubling). Exhausted retries
    /// and all other errors propagate to the caller.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&path)?;
            let mut attempt = 0u32;
            loop {
                match f(&conn) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                        std::thread::sleep(Duration::from_millis(BUSY_BACKOFF_MS << attempt));
                        attempt += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        })
        .await?
    }

}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn open_conn(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;
    apply_migrations(&conn)?;
    Ok(())
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (id INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
    )?;
    for (id, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO migrations (id, applied_at) VALUES (?1, ?2)",
            params![id, now_ts()],
        )?;
        tx.commit()?;
        tracing::info!("Applied migration {id}");
    }
    Ok(())
}
