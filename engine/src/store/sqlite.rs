// SQLite-backed shared store.
//
// Several engine processes on the same host (e.g. behind a local load
// balancer) open the same file. WAL mode lets readers proceed while one
// writer commits, and every value is a single row so an upsert is atomic.
//
// rusqlite is synchronous; every call goes through spawn_blocking.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::SharedStateStore;
use crate::unix_ms;

pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    /// Opens (and creates, if needed) the database once so a bad path is
    /// reported at start-up rather than on the first request.
    pub async fn open(path: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        let p = path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = Connection::open(&p)?;
            db_init(&conn)?;
            Ok(())
        })
        .await??;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut conn = Connection::open(path)?;
            conn.busy_timeout(Duration::from_millis(500))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("sqlite task join failed: {e}"))?
    }
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS kv (
            key            TEXT PRIMARY KEY,
            value          TEXT NOT NULL,
            expires_at_ms  INTEGER NOT NULL
        );
        "#,
    )
}

fn db_get(conn: &Connection, key: &str, now_ms: i64) -> anyhow::Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM kv WHERE key = ?1 AND expires_at_ms > ?2",
            params![key, now_ms],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn db_set(conn: &mut Connection, key: &str, value: &str, expires_at_ms: i64, now_ms: i64) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM kv WHERE expires_at_ms <= ?1", params![now_ms])?;
    tx.execute(
        "INSERT INTO kv (key, value, expires_at_ms)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value=excluded.value,
           expires_at_ms=excluded.expires_at_ms",
        params![key, value, expires_at_ms],
    )?;
    tx.commit()?;
    Ok(())
}

fn db_touch(conn: &Connection, key: &str, expires_at_ms: i64, now_ms: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE kv SET expires_at_ms = ?2 WHERE key = ?1 AND expires_at_ms > ?3",
        params![key, expires_at_ms, now_ms],
    )?;
    Ok(())
}

#[async_trait]
impl SharedStateStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| db_get(conn, &key, unix_ms())).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            let now = unix_ms();
            db_set(conn, &key, &value, now + ttl.as_millis() as i64, now)
        })
        .await
    }

    async fn touch(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = unix_ms();
            db_touch(conn, &key, now + ttl.as_millis() as i64, now)
        })
        .await
    }
}
